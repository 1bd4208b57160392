//! Signal collapsing: timestamped evidence from independent tasks folded
//! into corroborated moments.
//!
//! Spans are sorted by start time and grouped while they fall within the
//! window of the group's first span. A moment's corroboration grows with the
//! number of distinct tasks that flagged it.

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{Corroboration, CorroboratedMoment, EvidenceSpan, StageId, StageOutput};

/// Default grouping window in seconds
pub const DEFAULT_WINDOW_SECONDS: f64 = 2.0;

/// Collapse the evidence of every usable result in `outputs`
pub fn collapse_outputs<'a>(
    outputs: impl IntoIterator<Item = &'a StageOutput>,
    window_seconds: f64,
) -> Vec<CorroboratedMoment> {
    let spans = outputs.into_iter().flat_map(|output| {
        output.usable_results().flat_map(move |result| {
            let source = result.task.to_string();
            result
                .payload
                .iter()
                .flat_map(|p| p.evidence.iter())
                .map(move |span| (source.clone(), span))
        })
    });

    collapse(spans, window_seconds)
}

/// Group `(source, span)` pairs into moments
pub fn collapse<'a>(
    spans: impl IntoIterator<Item = (String, &'a EvidenceSpan)>,
    window_seconds: f64,
) -> Vec<CorroboratedMoment> {
    let mut spans: Vec<(String, &EvidenceSpan)> = spans
        .into_iter()
        .filter(|(_, span)| span.start_seconds.is_finite())
        .collect();
    spans.sort_by(|a, b| a.1.start_seconds.total_cmp(&b.1.start_seconds));

    let mut moments = Vec::new();
    let mut group: Vec<(String, &EvidenceSpan)> = Vec::new();

    for item in spans {
        let starts_new = group
            .first()
            .map(|(_, first)| item.1.start_seconds - first.start_seconds > window_seconds)
            .unwrap_or(false);
        if starts_new {
            moments.push(moment(std::mem::take(&mut group)));
        }
        group.push(item);
    }
    if !group.is_empty() {
        moments.push(moment(group));
    }

    moments
}

fn moment(group: Vec<(String, &EvidenceSpan)>) -> CorroboratedMoment {
    let sources: BTreeSet<String> = group.iter().map(|(s, _)| s.clone()).collect();
    let at_seconds =
        group.iter().map(|(_, span)| span.start_seconds).sum::<f64>() / group.len() as f64;

    CorroboratedMoment {
        at_seconds,
        corroboration: Corroboration::from_source_count(sources.len()),
        sources: sources.into_iter().collect(),
        descriptions: group.into_iter().map(|(_, span)| span.description.clone()).collect(),
    }
}

/// Moments seen by at least two sources, for prompts and summaries
pub fn corroborated(moments: &[CorroboratedMoment]) -> Vec<&CorroboratedMoment> {
    moments
        .iter()
        .filter(|m| m.corroboration != Corroboration::Low)
        .collect()
}

/// Stage outputs that may feed signal collapsing: everything but synthesis
pub fn upstream_outputs(
    outputs: &BTreeMap<StageId, StageOutput>,
) -> impl Iterator<Item = &StageOutput> {
    outputs
        .iter()
        .filter(|(stage, _)| **stage != StageId::Synthesis)
        .map(|(_, output)| output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(at: f64, text: &str) -> EvidenceSpan {
        EvidenceSpan {
            start_seconds: at,
            end_seconds: None,
            description: text.to_string(),
        }
    }

    #[test]
    fn test_window_is_anchored_on_first_span() {
        let a = span(10.0, "gaze aversion");
        let b = span(11.5, "pitch rise");
        let c = span(12.5, "self touch");
        let d = span(30.0, "pause");

        let moments = collapse(
            vec![
                ("visual/kinesic_log".to_string(), &c),
                ("visual/kinesic_log".to_string(), &a),
                ("voice/audio_linguistic".to_string(), &b),
                ("voice/audio_linguistic".to_string(), &d),
            ],
            DEFAULT_WINDOW_SECONDS,
        );

        // 12.5 is more than 2s after 10.0, so it opens a new group
        assert_eq!(moments.len(), 3);
        assert_eq!(moments[0].sources.len(), 2);
        assert_eq!(moments[0].corroboration, Corroboration::Medium);
        assert!((moments[0].at_seconds - 10.75).abs() < 1e-9);
        assert_eq!(moments[1].corroboration, Corroboration::Low);
        assert_eq!(moments[2].descriptions, vec!["pause".to_string()]);
    }

    #[test]
    fn test_corroboration_counts_distinct_sources() {
        let spans: Vec<EvidenceSpan> = (0..6).map(|i| span(5.0 + i as f64 * 0.1, "x")).collect();
        let sources = ["a/1", "a/2", "b/1", "b/2", "c/1", "a/1"];

        let moments = collapse(
            sources.iter().zip(spans.iter()).map(|(s, sp)| (s.to_string(), sp)),
            DEFAULT_WINDOW_SECONDS,
        );

        assert_eq!(moments.len(), 1);
        assert_eq!(moments[0].sources.len(), 5);
        assert_eq!(moments[0].corroboration, Corroboration::Critical);
        assert_eq!(corroborated(&moments).len(), 1);
    }

    #[test]
    fn test_no_spans_no_moments() {
        assert!(collapse(Vec::new(), DEFAULT_WINDOW_SECONDS).is_empty());
    }
}
