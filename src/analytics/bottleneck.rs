use super::types::StageCount;

/// Stage holding the most workflows. Ties go to the stage earliest in the
/// configured order; with no workflows at all there is no bottleneck.
pub fn find_bottleneck(counts: &[StageCount]) -> Option<String> {
    let mut best: Option<&StageCount> = None;
    for count in counts.iter().filter(|c| c.count > 0) {
        if best.map_or(true, |b| count.count > b.count) {
            best = Some(count);
        }
    }
    best.map(|c| c.stage.clone())
}
