use std::sync::Arc;

use chrono::Duration;
use log::debug;

use crate::{
    clock::Clock,
    error::{Error, Result},
    model::{
        db::{Ballot, DetectionMetadata, VoterStatus},
        guard::Screening,
        mongodb::Id,
        roster::Roster,
        store::DynStore,
        transaction::retry_on_conflict,
    },
};

/// At most `max_votes` ballots per keyed network within `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_votes: u64,
    pub window: Duration,
}

/// Records one vote for one position, at most once per voter.
pub struct BallotTransaction {
    store: DynStore,
    roster: Arc<Roster>,
    clock: Arc<dyn Clock>,
    rate_limit: Option<RateLimit>,
    retries: usize,
}

impl BallotTransaction {
    pub fn new(
        store: DynStore,
        roster: Arc<Roster>,
        clock: Arc<dyn Clock>,
        rate_limit: Option<RateLimit>,
        retries: usize,
    ) -> Self {
        Self {
            store,
            roster,
            clock,
            rate_limit,
            retries,
        }
    }

    /// Cast the voter's vote for `candidate_id` as their choice for `position`.
    ///
    /// Every check is repeated against fresh state if the commit loses a race,
    /// so of two concurrent casts for the same position exactly one succeeds
    /// and the other reports the position as already voted.
    pub async fn cast(
        &self,
        voter_id: Id,
        candidate_id: &str,
        position: &str,
        screening: &Screening,
    ) -> Result<Ballot> {
        retry_on_conflict(self.retries, || {
            self.attempt(voter_id, candidate_id, position, screening)
        })
        .await
    }

    async fn attempt(
        &self,
        voter_id: Id,
        candidate_id: &str,
        position: &str,
        screening: &Screening,
    ) -> Result<Ballot> {
        let voter = self
            .store
            .voter_by_id(voter_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Voter with ID '{voter_id}'")))?;
        if voter.status == VoterStatus::Completed || voter.has_voted(position) {
            return Err(Error::AlreadyVoted(position.to_string()));
        }

        let candidate = self
            .roster
            .candidate(candidate_id)
            .ok_or_else(|| Error::CandidateNotFound(candidate_id.to_string()))?;
        if candidate.position != position {
            return Err(Error::CandidateMismatch {
                candidate: candidate_id.to_string(),
                position: position.to_string(),
            });
        }

        let now = self.clock.now();
        if let (Some(limit), Some(network)) = (self.rate_limit, &screening.network_key) {
            let recent = self
                .store
                .recent_ballots_from_network(network, now - limit.window)
                .await?;
            if recent >= limit.max_votes {
                debug!("Network rate limit reached ({recent} votes)");
                return Err(Error::RateLimit);
            }
        }

        let detection = DetectionMetadata {
            network: screening.network_key.clone(),
            device: screening.device_key.clone(),
        };
        let ballot = Ballot::new(voter.id, candidate_id, position, now, detection);
        self.store
            .commit_vote(voter.id, voter.version, &ballot)
            .await?;
        Ok(ballot)
    }
}

#[cfg(test)]
mod tests {
    use rocket::futures::future::join_all;

    use crate::{
        clock::{manual::ManualClock, SystemClock},
        model::{
            db::Voter,
            store::{MemoryStore, Store},
        },
    };

    use super::*;

    async fn setup(rate_limit: Option<RateLimit>) -> (BallotTransaction, MemoryStore, Voter) {
        let store = MemoryStore::new();
        let voter = Voter::example();
        store.register_voter(&voter, &[]).await.unwrap();
        let ballots = BallotTransaction::new(
            Arc::new(store.clone()),
            Arc::new(Roster::example()),
            Arc::new(SystemClock),
            rate_limit,
            3,
        );
        (ballots, store, voter)
    }

    fn screening(network: &str) -> Screening {
        Screening {
            network_key: Some(network.to_string()),
            ..Screening::default()
        }
    }

    #[rocket::async_test]
    async fn cast_records_ballot_and_vote() {
        let (ballots, store, voter) = setup(None).await;
        let ballot = ballots
            .cast(voter.id, "c1", "President", &screening("net"))
            .await
            .unwrap();
        assert!(ballot.valid);
        assert_eq!(ballot.detection.network.as_deref(), Some("net"));

        let stored = store.voter_by_id(voter.id).await.unwrap().unwrap();
        assert_eq!(stored.voted_positions, vec!["President"]);
        assert_eq!(stored.votes[0].candidate_id, "c1");
        assert_eq!(stored.vote_count, 1);
        assert_eq!(store.ballots(), vec![ballot]);
    }

    #[rocket::async_test]
    async fn second_vote_for_position_is_refused() {
        let (ballots, store, voter) = setup(None).await;
        let none = Screening::default();
        ballots.cast(voter.id, "c1", "President", &none).await.unwrap();
        let result = ballots.cast(voter.id, "c2", "President", &none).await;
        assert!(matches!(result, Err(Error::AlreadyVoted(p)) if p == "President"));
        assert_eq!(store.ballots().len(), 1);
    }

    #[rocket::async_test]
    async fn unknown_or_misplaced_candidates_are_refused() {
        let (ballots, store, voter) = setup(None).await;
        let none = Screening::default();
        let result = ballots.cast(voter.id, "c99", "President", &none).await;
        assert!(matches!(result, Err(Error::CandidateNotFound(_))));
        let result = ballots.cast(voter.id, "c3", "President", &none).await;
        assert!(matches!(result, Err(Error::CandidateMismatch { .. })));
        assert!(store.ballots().is_empty());
    }

    #[rocket::async_test]
    async fn concurrent_casts_record_exactly_one_ballot() {
        let (ballots, store, voter) = setup(None).await;
        let none = Screening::default();
        let attempts = ["c1", "c2", "c1", "c2", "c1", "c2", "c1", "c2"]
            .map(|candidate| ballots.cast(voter.id, candidate, "President", &none));
        let results = join_all(attempts).await;

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(succeeded, 1);
        for result in results.iter().filter(|r| r.is_err()) {
            assert!(matches!(result, Err(Error::AlreadyVoted(_))), "{result:?}");
        }
        assert_eq!(store.ballots().len(), 1);
        let stored = store.voter_by_id(voter.id).await.unwrap().unwrap();
        assert_eq!(stored.vote_count, 1);
    }

    #[rocket::async_test]
    async fn network_rate_limit_applies_within_window() {
        let limit = RateLimit {
            max_votes: 2,
            window: Duration::minutes(10),
        };
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let ballots = BallotTransaction::new(
            Arc::new(store.clone()),
            Arc::new(Roster::example()),
            clock.clone(),
            Some(limit),
            3,
        );
        let (a, b) = (Voter::example(), Voter::example2());
        store.register_voter(&a, &[]).await.unwrap();
        store.register_voter(&b, &[]).await.unwrap();

        let shared = screening("net");
        ballots.cast(a.id, "c1", "President", &shared).await.unwrap();
        ballots.cast(b.id, "c2", "President", &shared).await.unwrap();
        let result = ballots.cast(a.id, "c3", "Vice President", &shared).await;
        assert!(matches!(result, Err(Error::RateLimit)));

        // Other networks are unaffected, and the limit lifts once the window passes.
        ballots
            .cast(a.id, "c3", "Vice President", &screening("other"))
            .await
            .unwrap();
        clock.advance(Duration::minutes(11));
        ballots.cast(b.id, "c4", "Vice President", &shared).await.unwrap();
    }
}
