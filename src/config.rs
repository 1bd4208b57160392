//! Configuration for the profiler.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PROFILER_HOME, OPENROUTER_API_KEY, PROFILER_PROVIDER_URL)
//! 2. Config file (.profiler/config.yaml)
//! 3. Defaults (~/.profiler)
//!
//! Config file discovery:
//! - Searches current directory and parents for .profiler/config.yaml
//! - Paths in the config file are relative to the .profiler/ directory
//!
//! The resolved configuration is an explicit value handed to whatever needs
//! it; nothing is cached process-wide.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::OpenRouterSettings;
use crate::core::{EventStore, PipelineDefinition, ResolverConfig, ResultCache, RunLimits};

/// Name of the per-project configuration directory
pub const CONFIG_DIR: &str = ".profiler";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub limits: RunLimits,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub provider: OpenRouterSettings,
    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory
    pub home: Option<String>,
    /// Prompt template directory
    pub templates: Option<String>,
    /// Pipeline definition YAML replacing the built-in pipeline
    pub pipeline: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Persist results under `<home>/cache`
    #[serde(default = "default_cache_enabled")]
    pub persistent: bool,
    /// Entries older than this are evicted on open
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
}

fn default_cache_enabled() -> bool {
    true
}
fn default_max_age_days() -> i64 {
    crate::core::cache::DEFAULT_MAX_AGE_DAYS
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persistent: default_cache_enabled(),
            max_age_days: default_max_age_days(),
        }
    }
}

/// Values read from the process environment
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub home: Option<PathBuf>,
    pub api_key: Option<String>,
    pub provider_url: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            home: var("PROFILER_HOME").map(PathBuf::from),
            api_key: var("OPENROUTER_API_KEY"),
            provider_url: var("PROFILER_PROVIDER_URL"),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory (runs, cache)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Pipeline definition file (if configured)
    pub pipeline_file: Option<PathBuf>,
    pub limits: RunLimits,
    pub resolver: ResolverConfig,
    /// Provider settings with templates dir and API key resolved
    pub provider: OpenRouterSettings,
    pub cache: CacheConfig,
}

impl ResolvedConfig {
    /// Load from the current directory and the process environment
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        let default_home = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(CONFIG_DIR);

        Self::resolve(find_config_file(&cwd), &EnvOverrides::from_env(), default_home)
    }

    /// Merge a config file (if any), environment overrides and defaults
    pub fn resolve(
        config_file: Option<PathBuf>,
        env: &EnvOverrides,
        default_home: PathBuf,
    ) -> Result<Self> {
        let (file, config_dir) = match &config_file {
            Some(path) => {
                let file = load_config_file(path)?;
                let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
                (Some(file), Some(dir))
            }
            None => (None, None),
        };

        let relative = |value: &Option<String>| -> Option<PathBuf> {
            match (value, &config_dir) {
                (Some(v), Some(dir)) => Some(resolve_path(dir, v)),
                (Some(v), None) => Some(PathBuf::from(v)),
                _ => None,
            }
        };

        let paths = file.as_ref().map(|f| f.paths.clone()).unwrap_or_default();

        let home = env
            .home
            .clone()
            .or_else(|| relative(&paths.home))
            .unwrap_or(default_home);

        let mut provider = file
            .as_ref()
            .map(|f| f.provider.clone())
            .unwrap_or_default();
        provider.templates_dir = relative(&paths.templates).unwrap_or_else(|| home.join("templates"));
        if let Some(key) = &env.api_key {
            provider.api_key = Some(key.clone());
        }
        if let Some(url) = &env.provider_url {
            provider.base_url = url.clone();
        }

        let limits = file.as_ref().map(|f| f.limits.clone()).unwrap_or_default();
        let resolver = file.as_ref().map(|f| f.resolver.clone()).unwrap_or_default();
        let cache = file.as_ref().map(|f| f.cache.clone()).unwrap_or_default();

        Ok(Self {
            pipeline_file: relative(&paths.pipeline),
            home,
            config_file,
            limits,
            resolver,
            provider,
            cache,
        })
    }

    /// Directory holding one subdirectory per run
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Directory holding persisted cache entries
    pub fn cache_dir(&self) -> PathBuf {
        self.home.join("cache")
    }

    pub fn event_store(&self) -> EventStore {
        EventStore::new(self.runs_dir())
    }

    /// Open the result cache, evicting expired entries
    pub fn open_cache(&self) -> Result<ResultCache> {
        if !self.cache.persistent {
            return Ok(ResultCache::in_memory());
        }

        let cache = ResultCache::open(&self.cache_dir())?;
        cache.evict_expired(chrono::Duration::days(self.cache.max_age_days));
        Ok(cache)
    }

    /// The configured pipeline definition, or the built-in one
    pub fn load_pipeline(&self) -> Result<PipelineDefinition> {
        match &self.pipeline_file {
            Some(path) => PipelineDefinition::from_file(path),
            None => Ok(PipelineDefinition::standard()),
        }
    }
}

/// Find config file by searching `start` and its parents
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}
