//! Turns raw probability vectors into ranked emotion scores

use crate::service::types::EmotionScore;

use super::labels::LabelMap;

/// Pair each probability with its label and sort by score, highest first
///
/// Indices with no label in `labels` are dropped.
pub fn rank_emotions(probabilities: &[f32], labels: &LabelMap) -> Vec<EmotionScore> {
    let mut scores: Vec<EmotionScore> = probabilities
        .iter()
        .enumerate()
        .filter_map(|(idx, &score)| labels.get(idx).map(|label| EmotionScore::new(label, score)))
        .collect();

    scores.sort_by(|a, b| b.score.total_cmp(&a.score));
    scores
}
