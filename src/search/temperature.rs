//! Temperature weighting of historical scores.

/// Factor applied to each historical score, dividing below the border and
/// multiplying at or above it.
pub const SCORE_MODIFIER: f64 = 2.0;

/// Rank below which scores are suppressed.
///
/// `floor(len * temperature) - 1`; negative at low temperature, so every
/// rank is amplified.
pub fn border(len: usize, temperature: f64) -> i64 {
    (len as f64 * temperature).floor() as i64 - 1
}

/// Weight one score at `rank` in a list of `len` scores sorted ascending.
pub fn relative_score_for_element(score: f64, temperature: f64, rank: usize, len: usize) -> f64 {
    if (rank as i64) < border(len, temperature) {
        score / SCORE_MODIFIER
    } else {
        score * SCORE_MODIFIER
    }
}

/// Sum of [`relative_score_for_element`] over an ascending score list.
pub fn relative_score_sum(scores: &[f64], temperature: f64) -> f64 {
    scores
        .iter()
        .enumerate()
        .map(|(rank, &score)| relative_score_for_element(score, temperature, rank, scores.len()))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_border_example() {
        assert_eq!(border(10, 0.5), 4);
        assert_eq!(relative_score_for_element(8.0, 0.5, 3, 10), 4.0);
        assert_eq!(relative_score_for_element(8.0, 0.5, 4, 10), 16.0);
    }

    #[test]
    fn test_border_rises_with_temperature() {
        assert_eq!(border(10, 0.0), -1);
        assert_eq!(border(10, 1.0), 9);
        assert!(border(10, 1.0) > border(10, 0.0));
    }

    #[test]
    fn test_cold_amplifies_everything() {
        let scores = [1.0, 2.0, 3.0];
        assert_eq!(relative_score_sum(&scores, 0.0), 12.0);
    }

    #[test]
    fn test_hot_favors_tail() {
        let scores = [1.0, 2.0, 3.0, 4.0];
        // border 3: ranks 0..3 halved, rank 3 doubled
        assert_eq!(relative_score_sum(&scores, 1.0), 0.5 + 1.0 + 1.5 + 8.0);
        let tail_share = relative_score_for_element(4.0, 1.0, 3, 4) / relative_score_sum(&scores, 1.0);
        let cold_share = relative_score_for_element(4.0, 0.0, 3, 4) / relative_score_sum(&scores, 0.0);
        assert!(tail_share > cold_share);
    }

    #[test]
    fn test_empty_sum() {
        assert_eq!(relative_score_sum(&[], 0.7), 0.0);
    }
}
