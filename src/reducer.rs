//! Write-Error Reducer: collapses per-replica outcomes into a single
//! success/failure verdict plus the index of the replica to treat as source
//! of truth.

/// Outcome of reducing `N` per-replica results. `Source` names the winning
/// replica index (the one whose `ObjectInfo` the caller should return to the
/// client and whose content reconciles the losers). `Failure` carries the
/// first observed error; per the design this is surfaced verbatim rather
/// than aggregated, since "both replicas failed" degrades to "the request
/// failed" from the client's perspective.
#[derive(Debug)]
pub enum Reduced<E> {
    Source(usize),
    Failure(E),
}

/// Reduce `outcomes[i] = None` (success) or `Some(err)` (failure) for
/// replica `i`. Any single success wins over any number of failures; among
/// successes, the lowest index wins. Only meaningful for non-empty input.
pub fn reduce<E>(outcomes: Vec<Option<E>>) -> Reduced<E> {
    for (i, outcome) in outcomes.iter().enumerate() {
        if outcome.is_none() {
            return Reduced::Source(i);
        }
    }
    let mut outcomes = outcomes;
    let first = outcomes
        .iter_mut()
        .find_map(Option::take)
        .expect("reduce called with empty or all-None outcomes");
    Reduced::Failure(first)
}

/// The replica indices that failed, for journaling callers that need to
/// name every loser rather than just the winner.
pub fn failed_indices<E>(outcomes: &[Option<E>]) -> Vec<usize> {
    outcomes
        .iter()
        .enumerate()
        .filter_map(|(i, outcome)| outcome.as_ref().map(|_| i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_succeed_picks_index_zero() {
        let outcomes: Vec<Option<&str>> = vec![None, None];
        assert!(matches!(reduce(outcomes), Reduced::Source(0)));
    }

    #[test]
    fn first_fails_second_succeeds() {
        let outcomes = vec![Some("boom"), None];
        assert!(matches!(reduce(outcomes), Reduced::Source(1)));
    }

    #[test]
    fn first_succeeds_second_fails() {
        let outcomes = vec![None, Some("boom")];
        assert!(matches!(reduce(outcomes), Reduced::Source(0)));
    }

    #[test]
    fn both_fail_returns_first_error() {
        let outcomes = vec![Some("first"), Some("second")];
        match reduce(outcomes) {
            Reduced::Failure(e) => assert_eq!(e, "first"),
            Reduced::Source(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn failed_indices_lists_losers() {
        let outcomes = vec![None, Some("boom")];
        assert_eq!(failed_indices(&outcomes), vec![1]);
    }

    #[test]
    fn failed_indices_empty_when_all_succeed() {
        let outcomes: Vec<Option<&str>> = vec![None, None];
        assert!(failed_indices(&outcomes).is_empty());
    }
}
