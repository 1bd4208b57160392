//! The synthesized profile handed to export and reporting collaborators.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::stage::StageId;

/// Evidence channel a stage speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Visual,
    Vocal,
    Multimodal,
    /// Text-only synthesis over the other modalities
    Integrated,
}

impl Modality {
    /// Modality whose readings a stage contributes
    pub fn of_stage(stage: StageId) -> Self {
        match stage {
            StageId::Video | StageId::Visual => Modality::Visual,
            StageId::Audio | StageId::Voice => Modality::Vocal,
            StageId::Multimodal => Modality::Multimodal,
            StageId::Synthesis => Modality::Integrated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Visual => "visual",
            Modality::Vocal => "vocal",
            Modality::Multimodal => "multimodal",
            Modality::Integrated => "integrated",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One modality's aggregated verdict on an axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalityVerdict {
    pub modality: Modality,

    /// Pole label (or "neutral")
    pub verdict: String,

    /// Signed position on the axis in [-1, 1]
    pub value: f64,

    pub confidence: f64,

    /// Tasks whose readings went into this verdict (`stage/task`)
    pub sources: Vec<String>,
}

/// Outcome of arbitrating one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisStatus {
    /// Exactly one modality reported
    SingleSource,

    /// Every reporting modality agreed within tolerance
    Agreed,

    /// At least one modality dissented; see the conflict list
    Contested,

    /// No successful task reported on this axis
    InsufficientData,
}

/// Resolved verdict for one judgment axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisResolution {
    pub axis: String,

    pub status: AxisStatus,

    /// `None` only for `InsufficientData`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    pub confidence: f64,

    /// Every contributing modality verdict, as reported
    pub contributions: Vec<ModalityVerdict>,
}

/// How a disagreement was arbitrated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Winner had the higher configured reliability for the axis
    ReliabilityPrecedence,

    /// Reliability tied (or ignored); the more confident modality won
    ConfidenceTieBreak,

    /// Reliability and confidence tied; fixed modality order decided
    ModalityOrder,
}

/// A documented disagreement between two modalities on one axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub axis: String,

    pub modality_a: ModalityVerdict,

    pub modality_b: ModalityVerdict,

    pub strategy: ResolutionStrategy,

    pub resolved_verdict: String,

    pub resolved_confidence: f64,
}

/// How many independent tasks flagged a moment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Corroboration {
    Low,
    Medium,
    High,
    Critical,
}

impl Corroboration {
    pub fn from_source_count(count: usize) -> Self {
        match count {
            0 | 1 => Corroboration::Low,
            2 => Corroboration::Medium,
            3 | 4 => Corroboration::High,
            _ => Corroboration::Critical,
        }
    }
}

/// Evidence spans from several tasks collapsed onto one moment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorroboratedMoment {
    /// Mean timestamp of the collapsed spans
    pub at_seconds: f64,

    pub corroboration: Corroboration,

    /// Distinct `stage/task` sources
    pub sources: Vec<String>,

    pub descriptions: Vec<String>,
}

/// Coarse label for a confidence score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Low,
    Moderate,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            ConfidenceLevel::VeryHigh
        } else if score >= 0.6 {
            ConfidenceLevel::High
        } else if score >= 0.3 {
            ConfidenceLevel::Moderate
        } else {
            ConfidenceLevel::Low
        }
    }
}

/// Final unified output of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedProfile {
    pub axes: BTreeMap<String, AxisResolution>,

    /// Every cross-modal disagreement and how it was arbitrated
    pub conflicts: Vec<ConflictRecord>,

    pub moments: Vec<CorroboratedMoment>,

    /// Summaries from synthesis tasks, keyed by task name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub narrative: BTreeMap<String, String>,

    /// Input quality score in [0, 1]
    pub data_quality: f64,

    pub overall_confidence: f64,

    pub confidence_level: ConfidenceLevel,

    /// Stages that lost optional work
    pub degraded_stages: Vec<StageId>,

    /// Built from an incomplete stage prefix
    pub partial: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl SynthesizedProfile {
    /// Axes that could not be resolved for lack of data
    pub fn insufficient_axes(&self) -> Vec<&str> {
        self.axes
            .values()
            .filter(|a| a.status == AxisStatus::InsufficientData)
            .map(|a| a.axis.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_levels() {
        assert_eq!(ConfidenceLevel::from_score(0.1), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from_score(0.3), ConfidenceLevel::Moderate);
        assert_eq!(ConfidenceLevel::from_score(0.65), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(0.8), ConfidenceLevel::VeryHigh);
    }

    #[test]
    fn test_corroboration_thresholds() {
        assert_eq!(Corroboration::from_source_count(1), Corroboration::Low);
        assert_eq!(Corroboration::from_source_count(2), Corroboration::Medium);
        assert_eq!(Corroboration::from_source_count(3), Corroboration::High);
        assert_eq!(Corroboration::from_source_count(5), Corroboration::Critical);
    }

    #[test]
    fn test_stage_modality_mapping() {
        assert_eq!(Modality::of_stage(StageId::Video), Modality::Visual);
        assert_eq!(Modality::of_stage(StageId::Voice), Modality::Vocal);
        assert_eq!(Modality::of_stage(StageId::Synthesis), Modality::Integrated);
    }
}
