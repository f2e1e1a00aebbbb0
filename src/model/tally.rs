use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use serde::Serialize;

use crate::{
    error::Result,
    model::{db::CandidateId, roster::Roster, store::DynStore},
};

/// Valid votes for one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateCount {
    pub candidate_id: CandidateId,
    pub candidate_name: String,
    pub count: u64,
}

/// Results for one position, most votes first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionTally {
    pub position: String,
    pub results: Vec<CandidateCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tally {
    /// Positions in roster order.
    pub vote_counts: Vec<PositionTally>,
    pub total_valid_votes: u64,
}

/// Counts valid ballots. Always reads the store; nothing is cached.
pub struct TallyAggregator {
    store: DynStore,
    roster: Arc<Roster>,
}

impl TallyAggregator {
    pub fn new(store: DynStore, roster: Arc<Roster>) -> Self {
        Self { store, roster }
    }

    pub async fn tally(&self) -> Result<Tally> {
        let counts = self.store.valid_ballot_counts().await?;
        for orphan in counts.iter().filter(|c| {
            !self
                .roster
                .candidates(&c.position)
                .any(|candidate| candidate.id == c.candidate_id)
        }) {
            warn!(
                "Ignoring {} valid ballot(s) for '{}' as {}, which is not on the roster",
                orphan.count, orphan.candidate_id, orphan.position
            );
        }
        let by_candidate = counts
            .iter()
            .map(|c| ((c.position.as_str(), c.candidate_id.as_str()), c.count))
            .collect::<HashMap<_, _>>();

        let vote_counts = self
            .roster
            .positions()
            .iter()
            .map(|position| {
                let mut results = self
                    .roster
                    .candidates(position)
                    .map(|candidate| CandidateCount {
                        candidate_id: candidate.id.clone(),
                        candidate_name: candidate.name.clone(),
                        count: by_candidate
                            .get(&(position.as_str(), candidate.id.as_str()))
                            .copied()
                            .unwrap_or(0),
                    })
                    .collect::<Vec<_>>();
                // Stable, so ties keep roster order.
                results.sort_by(|a, b| b.count.cmp(&a.count));
                PositionTally {
                    position: position.clone(),
                    results,
                }
            })
            .collect::<Vec<PositionTally>>();
        let total_valid_votes = vote_counts
            .iter()
            .flat_map(|p| &p.results)
            .map(|r| r.count)
            .sum();

        Ok(Tally {
            vote_counts,
            total_valid_votes,
        })
    }
}
