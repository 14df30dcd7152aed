use std::collections::HashSet;

use crate::config::EndpointId;
use crate::probe::ProbeResult;
use crate::run_state::RunRecord;

/// How the current pass's down results relate to the previous pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassDiff {
    /// Down now, not down last pass. These are alert-worthy.
    pub newly_down: Vec<ProbeResult>,
    /// Down now and already down last pass.
    pub still_down: Vec<ProbeResult>,
    /// Down last pass (entries from the previous record), not down now.
    pub recovered: Vec<ProbeResult>,
}

/// Down results in `current` whose endpoint was not down in `previous`,
/// in `current` order.
pub fn classify_new(previous: &RunRecord, current: &[ProbeResult]) -> Vec<ProbeResult> {
    diff_pass(previous, current).newly_down
}

pub fn diff_pass(previous: &RunRecord, current: &[ProbeResult]) -> PassDiff {
    let previously_down = previous.down_ids();
    let mut diff = PassDiff::default();

    for status in current.iter().filter(|s| !s.is_up) {
        if previously_down.contains(&status.id) {
            diff.still_down.push(status.clone());
        } else {
            diff.newly_down.push(status.clone());
        }
    }

    let currently_down: HashSet<EndpointId> = current
        .iter()
        .filter(|s| !s.is_up)
        .map(|s| s.id)
        .collect();
    diff.recovered = previous
        .down_servers()
        .iter()
        .filter(|s| !currently_down.contains(&s.id))
        .cloned()
        .collect();

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn status(id: EndpointId, is_up: bool) -> ProbeResult {
        ProbeResult {
            id,
            is_up,
            error: (!is_up).then(|| "500".to_string()),
            url: format!("site-{id}.example.com"),
            checked_at: Utc::now(),
        }
    }

    fn previous(ids: &[EndpointId]) -> RunRecord {
        RunRecord::new(
            ids.iter().map(|&id| status(id, false)).collect(),
            Utc::now(),
            Utc::now(),
        )
    }

    fn ids(results: &[ProbeResult]) -> Vec<EndpointId> {
        results.iter().map(|s| s.id).collect()
    }

    #[test]
    fn test_only_new_failures_are_alert_worthy() {
        let current = vec![status(2, false), status(3, false)];

        let alert = classify_new(&previous(&[1, 2]), &current);

        assert_eq!(alert, vec![current[1].clone()]);
    }

    #[test]
    fn test_known_failures_are_suppressed() {
        let current = vec![status(2, false), status(1, false)];
        assert!(classify_new(&previous(&[1, 2, 3]), &current).is_empty());
    }

    #[test]
    fn test_up_results_are_ignored() {
        let current = vec![status(1, true), status(2, true)];
        assert!(classify_new(&previous(&[]), &current).is_empty());
    }

    #[test]
    fn test_everything_is_new_on_first_run() {
        let current = vec![status(9, false), status(4, true), status(5, false)];
        assert_eq!(ids(&classify_new(&RunRecord::empty(), &current)), vec![9, 5]);
    }

    #[test]
    fn test_output_preserves_current_order() {
        let current = vec![status(30, false), status(10, false), status(20, false)];
        assert_eq!(ids(&classify_new(&previous(&[]), &current)), vec![30, 10, 20]);
    }

    #[test]
    fn test_diff_pass_partitions_results() {
        let current = vec![status(2, false), status(3, false), status(1, true)];

        let diff = diff_pass(&previous(&[1, 2, 4]), &current);

        assert_eq!(ids(&diff.newly_down), vec![3]);
        assert_eq!(ids(&diff.still_down), vec![2]);
        assert_eq!(ids(&diff.recovered), vec![1, 4]);
    }
}
