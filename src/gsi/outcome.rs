//! Response Outcome Aggregator
//!
//! Folds the replies of every remote cluster to one ownership inquiry into a
//! single decision. Replies arrive one at a time; the tracker reports a
//! decision as soon as one is reachable, which may be before every reply is
//! in (a definitive remote owner short-circuits the round).

use crate::directory::types::{ActivationAddress, ClusterId, GrainId};
use crate::gsi::precedence::precedes;
use crate::gsi::response::{ActivationResponseStatus, RemoteClusterActivationResponse};
use std::fmt;

/// Decision reached for one grain in one round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// Every remote cluster passed.
    Succeed,
    /// A remote cluster definitively owns the grain.
    RemoteOwner {
        address: ActivationAddress,
        cluster: ClusterId,
    },
    /// No owner yet; this candidate has the highest precedence among the contenders.
    RemoteOwnerLikely {
        address: ActivationAddress,
        cluster: ClusterId,
    },
    /// Not enough information; retry later.
    Inconclusive,
}

impl ActivationOutcome {
    /// Remote address to yield to, for either remote-owner outcome.
    pub fn remote_owner(&self) -> Option<(&ActivationAddress, &ClusterId)> {
        match self {
            ActivationOutcome::RemoteOwner { address, cluster }
            | ActivationOutcome::RemoteOwnerLikely { address, cluster } => Some((address, cluster)),
            _ => None,
        }
    }
}

impl fmt::Display for ActivationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationOutcome::Succeed => write!(f, "Succeed"),
            ActivationOutcome::RemoteOwner { cluster, .. } => write!(f, "RemoteOwner({})", cluster),
            ActivationOutcome::RemoteOwnerLikely { cluster, .. } => {
                write!(f, "RemoteOwnerLikely({})", cluster)
            }
            ActivationOutcome::Inconclusive => write!(f, "Inconclusive"),
        }
    }
}

/// Incremental tracker for the replies of one round.
pub struct ResponseTracker {
    grain: GrainId,
    responses: Vec<Option<RemoteClusterActivationResponse>>,
    outcome: Option<ActivationOutcome>,
}

impl ResponseTracker {
    /// Track `expected` replies for `grain`.
    pub fn new(grain: GrainId, expected: usize) -> Self {
        let responses = vec![None; expected];
        let outcome = Self::get_outcome(&grain, &responses);
        Self {
            grain,
            responses,
            outcome,
        }
    }

    /// Record the reply at `index` and return the decision, if one is reached.
    ///
    /// Once decided, later replies do not change the decision.
    pub fn record(
        &mut self,
        index: usize,
        response: RemoteClusterActivationResponse,
    ) -> Option<&ActivationOutcome> {
        if self.outcome.is_none() {
            if let Some(slot) = self.responses.get_mut(index) {
                *slot = Some(response);
            }
            self.outcome = Self::get_outcome(&self.grain, &self.responses);
        }
        self.outcome.as_ref()
    }

    pub fn outcome(&self) -> Option<&ActivationOutcome> {
        self.outcome.as_ref()
    }

    /// Consume the tracker, treating missing replies as faulted.
    pub fn finish(mut self) -> ActivationOutcome {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        for slot in self.responses.iter_mut().filter(|slot| slot.is_none()) {
            *slot = Some(RemoteClusterActivationResponse::faulted("no reply"));
        }
        Self::get_outcome(&self.grain, &self.responses).unwrap_or(ActivationOutcome::Inconclusive)
    }

    /// Decision for a set of replies, `None` entries being still pending.
    ///
    /// Returns `None` while undecided.
    pub fn get_outcome(
        grain: &GrainId,
        responses: &[Option<RemoteClusterActivationResponse>],
    ) -> Option<ActivationOutcome> {
        let definitive = responses.iter().flatten().find_map(|r| {
            match (r.is_definitive_owner(), &r.existing_activation, &r.owning_cluster) {
                (true, Some(address), Some(cluster)) => Some(ActivationOutcome::RemoteOwner {
                    address: address.clone(),
                    cluster: cluster.clone(),
                }),
                _ => None,
            }
        });
        if definitive.is_some() {
            return definitive;
        }

        if responses.iter().any(Option::is_none) {
            return None;
        }

        if responses
            .iter()
            .flatten()
            .all(|r| r.status == ActivationResponseStatus::Pass)
        {
            return Some(ActivationOutcome::Succeed);
        }

        let mut best: Option<(&ActivationAddress, &ClusterId)> = None;
        for r in responses.iter().flatten() {
            if r.status != ActivationResponseStatus::Failed || r.owned {
                continue;
            }
            let (Some(address), Some(cluster)) = (&r.existing_activation, &r.owning_cluster) else {
                continue;
            };
            best = match best {
                Some((_, best_cluster)) if precedes(grain, best_cluster, cluster) => best,
                _ => Some((address, cluster)),
            };
        }

        Some(match best {
            Some((address, cluster)) => ActivationOutcome::RemoteOwnerLikely {
                address: address.clone(),
                cluster: cluster.clone(),
            },
            None => ActivationOutcome::Inconclusive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::types::HostId;

    fn grain() -> GrainId {
        GrainId::new("Player", "1")
    }

    fn remote(cluster: &str) -> (ActivationAddress, ClusterId) {
        (
            ActivationAddress::new_activation(grain(), HostId::new(format!("{}:1", cluster))),
            ClusterId::new(cluster),
        )
    }

    fn owner(cluster: &str) -> RemoteClusterActivationResponse {
        let (address, cluster) = remote(cluster);
        RemoteClusterActivationResponse::failed_owner(address, cluster)
    }

    fn candidate(cluster: &str) -> RemoteClusterActivationResponse {
        let (address, cluster) = remote(cluster);
        RemoteClusterActivationResponse::failed_candidate(address, cluster)
    }

    #[test]
    fn test_definitive_owner_short_circuits_in_any_order() {
        let others = [
            RemoteClusterActivationResponse::pass(),
            RemoteClusterActivationResponse::faulted("timeout"),
            candidate("C"),
        ];

        for position in 0..=others.len() {
            let mut tracker = ResponseTracker::new(grain(), 5);
            let mut decided = None;
            for (i, r) in others.iter().cloned().enumerate().take(position) {
                decided = tracker.record(i, r).cloned();
            }
            assert!(decided.is_none());

            let decided = tracker.record(4, owner("B")).cloned().unwrap();
            assert!(matches!(decided, ActivationOutcome::RemoteOwner { ref cluster, .. } if cluster.as_str() == "B"));
        }
    }

    #[test]
    fn test_all_pass_succeeds() {
        let mut tracker = ResponseTracker::new(grain(), 3);
        assert!(tracker.record(0, RemoteClusterActivationResponse::pass()).is_none());
        assert!(tracker.record(2, RemoteClusterActivationResponse::pass()).is_none());
        assert_eq!(
            tracker.record(1, RemoteClusterActivationResponse::pass()),
            Some(&ActivationOutcome::Succeed)
        );
    }

    #[test]
    fn test_no_remote_clusters_succeeds() {
        let tracker = ResponseTracker::new(grain(), 0);
        assert_eq!(tracker.outcome(), Some(&ActivationOutcome::Succeed));
    }

    #[test]
    fn test_all_faulted_is_inconclusive() {
        let responses: Vec<_> = (0..3)
            .map(|_| Some(RemoteClusterActivationResponse::faulted("unreachable")))
            .collect();
        assert_eq!(
            ResponseTracker::get_outcome(&grain(), &responses),
            Some(ActivationOutcome::Inconclusive)
        );
    }

    #[test]
    fn test_rejection_without_candidate_is_inconclusive() {
        let responses = vec![
            Some(RemoteClusterActivationResponse::pass()),
            Some(RemoteClusterActivationResponse::rejected("not a member")),
        ];
        assert_eq!(
            ResponseTracker::get_outcome(&grain(), &responses),
            Some(ActivationOutcome::Inconclusive)
        );
    }

    #[test]
    fn test_best_candidate_wins_regardless_of_order() {
        let names = ["B", "C", "D", "E"];
        let expected = names
            .iter()
            .map(|n| ClusterId::new(*n))
            .reduce(|best, c| if precedes(&grain(), &best, &c) { best } else { c })
            .unwrap();

        let forward: Vec<_> = names.iter().map(|n| Some(candidate(n))).collect();
        let mut backward = forward.clone();
        backward.reverse();
        backward.push(Some(RemoteClusterActivationResponse::faulted("timeout")));

        for responses in [forward, backward] {
            match ResponseTracker::get_outcome(&grain(), &responses) {
                Some(ActivationOutcome::RemoteOwnerLikely { cluster, .. }) => {
                    assert_eq!(cluster, expected)
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[test]
    fn test_candidates_wait_for_pending_replies() {
        let responses = vec![Some(candidate("B")), None];
        assert_eq!(ResponseTracker::get_outcome(&grain(), &responses), None);
    }

    #[test]
    fn test_finish_treats_missing_as_faulted() {
        let mut tracker = ResponseTracker::new(grain(), 2);
        tracker.record(0, RemoteClusterActivationResponse::pass());
        assert_eq!(tracker.finish(), ActivationOutcome::Inconclusive);

        let mut tracker = ResponseTracker::new(grain(), 2);
        tracker.record(0, candidate("B"));
        assert!(matches!(tracker.finish(), ActivationOutcome::RemoteOwnerLikely { .. }));
    }

    #[test]
    fn test_decision_is_sticky() {
        let mut tracker = ResponseTracker::new(grain(), 2);
        tracker.record(0, owner("B"));
        tracker.record(1, RemoteClusterActivationResponse::pass());
        assert!(matches!(tracker.outcome(), Some(ActivationOutcome::RemoteOwner { .. })));
    }
}
