//! Cross-modal conflict resolution and profile synthesis.
//!
//! Every usable task payload reports scored readings on named axes. Readings
//! are mapped onto a signed scale per axis (negative pole -1, positive pole
//! +1, neutral 0), aggregated per modality, and arbitrated: one winning
//! modality per axis, agreeing modalities merged into it, and one conflict
//! record per dissenter. Axes nobody reported on stay `InsufficientData`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{
    AxisResolution, AxisStatus, ConfidenceLevel, ConflictRecord, CorroboratedMoment, Modality,
    ModalityVerdict, ResolutionStrategy, SourceSummary, StageId, StageOutput, StageStatus,
    SynthesizedProfile,
};

/// Label for readings that favor neither pole
pub const NEUTRAL: &str = "neutral";

/// A judgment axis and its two poles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisDefinition {
    pub name: String,

    /// Verdict label mapped to -1
    pub negative: String,

    /// Verdict label mapped to +1
    pub positive: String,

    /// Per-modality reliability; unlisted modalities default to 1.0
    #[serde(default)]
    pub reliability: BTreeMap<Modality, f64>,
}

impl AxisDefinition {
    pub fn new(name: &str, negative: &str, positive: &str) -> Self {
        Self {
            name: name.to_string(),
            negative: negative.to_string(),
            positive: positive.to_string(),
            reliability: BTreeMap::new(),
        }
    }

    pub fn reliability_of(&self, modality: Modality) -> f64 {
        self.reliability.get(&modality).copied().unwrap_or(1.0)
    }

    /// Signed pole of a verdict label, `None` when unrecognized
    fn pole(&self, verdict: &str) -> Option<f64> {
        let verdict = verdict.trim();
        if verdict.eq_ignore_ascii_case(&self.negative) {
            Some(-1.0)
        } else if verdict.eq_ignore_ascii_case(&self.positive) {
            Some(1.0)
        } else if verdict.eq_ignore_ascii_case(NEUTRAL) {
            Some(0.0)
        } else {
            None
        }
    }

    fn label(&self, value: f64, neutral_band: f64) -> String {
        if value > neutral_band {
            self.positive.clone()
        } else if value < -neutral_band {
            self.negative.clone()
        } else {
            NEUTRAL.to_string()
        }
    }
}

/// How the winning modality on an axis is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecedencePolicy {
    /// Higher configured reliability wins; ties go to higher confidence
    #[default]
    ReliabilityThenConfidence,

    /// Higher confidence wins regardless of reliability
    ConfidenceOnly,
}

/// Resolver tuning, as found under `resolver:` in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_axes")]
    pub axes: Vec<AxisDefinition>,

    #[serde(default)]
    pub precedence: PrecedencePolicy,

    /// Largest value gap at which two modalities still agree
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// |value| at or below which a verdict reads as neutral
    #[serde(default = "default_neutral_band")]
    pub neutral_band: f64,

    /// Confidence reduction per unit of the strongest dissent
    #[serde(default = "default_contested_penalty")]
    pub contested_penalty: f64,

    /// Overall confidence multiplier lost per degraded stage
    #[serde(default = "default_degraded_penalty")]
    pub degraded_penalty: f64,

    /// Share of overall confidence taken from data quality
    #[serde(default = "default_data_quality_weight")]
    pub data_quality_weight: f64,

    /// Grouping window for corroborated moments
    #[serde(default = "default_moment_window")]
    pub moment_window_seconds: f64,
}

fn default_axes() -> Vec<AxisDefinition> {
    vec![
        AxisDefinition::new("authenticity", "deceptive", "authentic"),
        AxisDefinition::new("emotional_valence", "negative", "positive"),
        AxisDefinition::new("threat", "low", "elevated"),
    ]
}
fn default_tolerance() -> f64 {
    0.5
}
fn default_neutral_band() -> f64 {
    0.1
}
fn default_contested_penalty() -> f64 {
    0.5
}
fn default_degraded_penalty() -> f64 {
    0.15
}
fn default_data_quality_weight() -> f64 {
    0.2
}
fn default_moment_window() -> f64 {
    super::signals::DEFAULT_WINDOW_SECONDS
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            axes: default_axes(),
            precedence: PrecedencePolicy::default(),
            tolerance: default_tolerance(),
            neutral_band: default_neutral_band(),
            contested_penalty: default_contested_penalty(),
            degraded_penalty: default_degraded_penalty(),
            data_quality_weight: default_data_quality_weight(),
            moment_window_seconds: default_moment_window(),
        }
    }
}

/// One task's reading on an axis, already placed on the signed scale
#[derive(Debug, Clone)]
struct SignedReading {
    source: String,
    value: f64,
    confidence: f64,
}

/// Arbitrates axis readings and assembles the final profile
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    config: ResolverConfig,
}

impl ConflictResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Build the profile from whatever stage outputs exist.
    ///
    /// `partial` marks profiles built from an incomplete stage prefix.
    pub fn synthesize(
        &self,
        outputs: &BTreeMap<StageId, StageOutput>,
        source: &SourceSummary,
        moments: Vec<CorroboratedMoment>,
        partial: bool,
    ) -> SynthesizedProfile {
        let mut warnings = Vec::new();
        let readings = self.collect_readings(outputs, &mut warnings);

        let mut axes = BTreeMap::new();
        let mut conflicts = Vec::new();
        for definition in &self.config.axes {
            let by_modality = readings.get(&definition.name);
            let (resolution, mut axis_conflicts) = self.resolve_axis(definition, by_modality);
            if resolution.status == AxisStatus::InsufficientData {
                warnings.push(format!("Insufficient data for axis '{}'", definition.name));
            }
            conflicts.append(&mut axis_conflicts);
            axes.insert(definition.name.clone(), resolution);
        }

        let degraded_stages: Vec<StageId> = outputs
            .values()
            .filter(|o| o.status == StageStatus::Degraded)
            .map(|o| o.stage)
            .collect();
        for output in outputs.values() {
            for result in output.results.values().filter(|r| !r.is_usable()) {
                let kind = result
                    .error_kind()
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                warnings.push(format!("Task {} failed ({})", result.task, kind));
            }
        }

        let narrative = outputs
            .get(&StageId::Synthesis)
            .map(|o| {
                o.payloads()
                    .into_iter()
                    .filter_map(|(name, p)| p.summary.clone().map(|s| (name.to_string(), s)))
                    .collect()
            })
            .unwrap_or_default();

        let data_quality = data_quality_score(source);
        let overall_confidence = self.overall_confidence(&axes, data_quality, degraded_stages.len());

        SynthesizedProfile {
            axes,
            conflicts,
            moments,
            narrative,
            data_quality,
            overall_confidence,
            confidence_level: ConfidenceLevel::from_score(overall_confidence),
            degraded_stages,
            partial,
            warnings,
        }
    }

    /// Readings per axis per modality from every usable result
    fn collect_readings(
        &self,
        outputs: &BTreeMap<StageId, StageOutput>,
        warnings: &mut Vec<String>,
    ) -> BTreeMap<String, BTreeMap<Modality, Vec<SignedReading>>> {
        let mut readings: BTreeMap<String, BTreeMap<Modality, Vec<SignedReading>>> =
            BTreeMap::new();

        for (stage, output) in outputs {
            let modality = Modality::of_stage(*stage);
            for result in output.usable_results() {
                let Some(payload) = &result.payload else {
                    continue;
                };
                for definition in &self.config.axes {
                    let Some(reading) = payload.axes.get(&definition.name) else {
                        continue;
                    };
                    let Some(pole) = definition.pole(&reading.verdict) else {
                        warnings.push(format!(
                            "Task {} reported unrecognized verdict '{}' on axis '{}'",
                            result.task, reading.verdict, definition.name
                        ));
                        continue;
                    };
                    readings
                        .entry(definition.name.clone())
                        .or_default()
                        .entry(modality)
                        .or_default()
                        .push(SignedReading {
                            source: result.task.to_string(),
                            value: pole * reading.intensity.unwrap_or(1.0),
                            confidence: reading.confidence,
                        });
                }
            }
        }

        readings
    }

    fn modality_verdict(
        &self,
        definition: &AxisDefinition,
        modality: Modality,
        readings: &[SignedReading],
    ) -> ModalityVerdict {
        let value = weighted_mean(readings.iter().map(|r| (r.value, r.confidence)));
        let confidence =
            readings.iter().map(|r| r.confidence).sum::<f64>() / readings.len().max(1) as f64;

        ModalityVerdict {
            modality,
            verdict: definition.label(value, self.config.neutral_band),
            value,
            confidence,
            sources: readings.iter().map(|r| r.source.clone()).collect(),
        }
    }

    /// Order two modality verdicts by precedence; `Less` means `a` wins
    fn precedence(
        &self,
        definition: &AxisDefinition,
        a: &ModalityVerdict,
        b: &ModalityVerdict,
    ) -> (Ordering, ResolutionStrategy) {
        if self.config.precedence == PrecedencePolicy::ReliabilityThenConfidence {
            let ra = definition.reliability_of(a.modality);
            let rb = definition.reliability_of(b.modality);
            if ra != rb {
                return (rb.total_cmp(&ra), ResolutionStrategy::ReliabilityPrecedence);
            }
        }
        if a.confidence != b.confidence {
            return (
                b.confidence.total_cmp(&a.confidence),
                ResolutionStrategy::ConfidenceTieBreak,
            );
        }
        (a.modality.cmp(&b.modality), ResolutionStrategy::ModalityOrder)
    }

    fn resolve_axis(
        &self,
        definition: &AxisDefinition,
        readings: Option<&BTreeMap<Modality, Vec<SignedReading>>>,
    ) -> (AxisResolution, Vec<ConflictRecord>) {
        let verdicts: Vec<ModalityVerdict> = readings
            .into_iter()
            .flat_map(|m| m.iter())
            .filter(|(_, r)| !r.is_empty())
            .map(|(modality, r)| self.modality_verdict(definition, *modality, r))
            .collect();

        let Some(winner) = verdicts
            .iter()
            .min_by(|a, b| self.precedence(definition, a, b).0)
            .cloned()
        else {
            return (
                AxisResolution {
                    axis: definition.name.clone(),
                    status: AxisStatus::InsufficientData,
                    verdict: None,
                    value: None,
                    confidence: 0.0,
                    contributions: Vec::new(),
                },
                Vec::new(),
            );
        };

        let (agreeing, dissenting): (Vec<&ModalityVerdict>, Vec<&ModalityVerdict>) = verdicts
            .iter()
            .partition(|v| (v.value - winner.value).abs() <= self.config.tolerance);

        let value = weighted_mean(agreeing.iter().map(|v| (v.value, v.confidence)));
        let mut confidence =
            agreeing.iter().map(|v| v.confidence).sum::<f64>() / agreeing.len() as f64;

        let strongest_dissent = dissenting
            .iter()
            .map(|v| v.confidence)
            .fold(0.0_f64, f64::max);
        confidence *= 1.0 - self.config.contested_penalty * strongest_dissent;
        let confidence = confidence.clamp(0.0, 1.0);

        let verdict = definition.label(value, self.config.neutral_band);

        let conflicts = dissenting
            .iter()
            .map(|dissenter| ConflictRecord {
                axis: definition.name.clone(),
                modality_a: winner.clone(),
                modality_b: (*dissenter).clone(),
                strategy: self.precedence(definition, &winner, dissenter).1,
                resolved_verdict: verdict.clone(),
                resolved_confidence: confidence,
            })
            .collect::<Vec<_>>();

        let status = if verdicts.len() == 1 {
            AxisStatus::SingleSource
        } else if conflicts.is_empty() {
            AxisStatus::Agreed
        } else {
            AxisStatus::Contested
        };

        (
            AxisResolution {
                axis: definition.name.clone(),
                status,
                verdict: Some(verdict),
                value: Some(value),
                confidence,
                contributions: verdicts,
            },
            conflicts,
        )
    }

    fn overall_confidence(
        &self,
        axes: &BTreeMap<String, AxisResolution>,
        data_quality: f64,
        degraded: usize,
    ) -> f64 {
        let analysis = if axes.is_empty() {
            0.0
        } else {
            axes.values().map(|a| a.confidence).sum::<f64>() / axes.len() as f64
        };
        let weight = self.config.data_quality_weight.clamp(0.0, 1.0);
        let base = weight * data_quality + (1.0 - weight) * analysis;
        let penalty = (1.0 - self.config.degraded_penalty).powi(degraded as i32);
        (base * penalty).clamp(0.0, 1.0)
    }
}

/// Confidence-weighted mean; plain mean when every weight is zero
fn weighted_mean(items: impl Iterator<Item = (f64, f64)> + Clone) -> f64 {
    let total_weight: f64 = items.clone().map(|(_, w)| w).sum();
    if total_weight > 0.0 {
        items.map(|(v, w)| v * w).sum::<f64>() / total_weight
    } else {
        let (sum, count) = items.fold((0.0, 0usize), |(s, n), (v, _)| (s + v, n + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }
}

/// Input quality score in [0, 1] from source metadata
pub fn data_quality_score(source: &SourceSummary) -> f64 {
    let mut score = 1.0;

    if source.duration_seconds < 15.0 {
        score -= 0.15;
    } else if source.duration_seconds < 30.0 {
        score -= 0.05;
    }

    if source.resolution.width < 480 || source.resolution.height < 360 {
        score -= 0.1;
    }

    if !source.has_audio {
        score -= 0.25;
    }

    if source.transcript_chars.unwrap_or(0) == 0 {
        score -= 0.1;
    }

    f64::clamp(score, 0.0, 1.0)
}
