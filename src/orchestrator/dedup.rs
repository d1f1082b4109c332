//! Collapsing overlapping analysis requests
//!
//! Many dashboard blocks can ask for the same cut of the same experiment.
//! Before they reach the orchestrator, requests are grouped by raw-extraction
//! settings so each distinct window is computed once, carrying the union of
//! its distinct analyses.

use crate::model::{AnalysisSettings, SnapshotSettings};

/// Group requests by snapshot settings, dropping repeated analyses.
///
/// Groups and the analyses inside them keep first-seen order.
pub fn dedupe<I>(requests: I) -> Vec<(SnapshotSettings, Vec<AnalysisSettings>)>
where
    I: IntoIterator<Item = (SnapshotSettings, AnalysisSettings)>,
{
    // Linear scans: settings are not Ord and request lists are short
    let mut groups: Vec<(SnapshotSettings, Vec<AnalysisSettings>)> = Vec::new();
    for (snapshot, analysis) in requests {
        match groups.iter_mut().find(|(s, _)| *s == snapshot) {
            Some((_, analyses)) => {
                if !analyses.contains(&analysis) {
                    analyses.push(analysis);
                }
            }
            None => groups.push((snapshot, vec![analysis])),
        }
    }
    groups
}

/// Pair every analysis with its snapshot settings again.
pub fn flatten(
    groups: &[(SnapshotSettings, Vec<AnalysisSettings>)],
) -> Vec<(SnapshotSettings, AnalysisSettings)> {
    groups
        .iter()
        .flat_map(|(snapshot, analyses)| {
            analyses
                .iter()
                .map(move |analysis| (snapshot.clone(), analysis.clone()))
        })
        .collect()
}

/// Drop repeated analyses, keeping first-seen order.
pub fn unique_analyses<I>(settings: I) -> Vec<AnalysisSettings>
where
    I: IntoIterator<Item = AnalysisSettings>,
{
    let mut unique: Vec<AnalysisSettings> = Vec::new();
    for s in settings {
        if !unique.contains(&s) {
            unique.push(s);
        }
    }
    unique
}
