//! Persistence behind a single injected interface.
//!
//! Every `commit_*` method is one atomic, isolated unit: either all of its
//! effects land or none do. Commits that change a voter's ballot state are
//! conditional on the voter's `version`, and cross-voter uniqueness is
//! enforced by the store itself rather than by a read beforehand.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    db::{Ballot, Candidate, CandidateId, CompletionRecord, SessionRecord, SignalClaim, Voter},
    fingerprint::{KeyedSignal, SignalKind},
    mongodb::{errors, index_names, Id},
};

mod memory;
mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Shared handle to whichever store is configured.
pub type DynStore = Arc<dyn Store>;

/// A uniqueness rule the store refused to break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    InstitutionalEmail,
    PersonalEmail,
    Signal(SignalKind),
    CompletionKey,
    ValidBallot,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The record changed since it was read, or the transaction was
    /// aborted by the database. Safe to retry.
    #[error("Concurrent modification")]
    Conflict,
    #[error("Uniqueness violation: {0:?}")]
    Violation(Violation),
    #[error(transparent)]
    Db(mongodb::error::Error),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        if errors::is_transient(&err) {
            return Self::Conflict;
        }
        if let Some(message) = errors::duplicate_key_message(&err) {
            let violation = if message.contains(index_names::INSTITUTIONAL_EMAIL) {
                Some(Violation::InstitutionalEmail)
            } else if message.contains(index_names::PERSONAL_EMAIL) {
                Some(Violation::PersonalEmail)
            } else if message.contains(index_names::COMPLETION_KEYS) {
                Some(Violation::CompletionKey)
            } else if message.contains(index_names::VALID_BALLOT) {
                Some(Violation::ValidBallot)
            } else if message.contains(index_names::COMPLETION_VOTER)
                || message.contains(index_names::CLAIM_SIGNAL)
            {
                // A concurrent writer got there first; a retry re-reads who.
                return Self::Conflict;
            } else {
                None
            };
            if let Some(violation) = violation {
                return Self::Violation(violation);
            }
        }
        Self::Db(err)
    }
}

/// Number of valid ballots for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BallotCount {
    pub position: String,
    pub candidate_id: CandidateId,
    pub count: u64,
}

#[rocket::async_trait]
pub trait Store: Send + Sync {
    async fn voter_by_id(&self, id: Id) -> Result<Option<Voter>, StoreError>;

    async fn voter_by_institutional_email(&self, email: &str)
        -> Result<Option<Voter>, StoreError>;

    async fn voter_by_personal_email(&self, email: &str) -> Result<Option<Voter>, StoreError>;

    /// The voter whose session matches `token_hash` and has not expired at `now`,
    /// in a single read.
    async fn voter_by_session(
        &self,
        email: &str,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Voter>, StoreError>;

    /// Existing claims on any of the given signals.
    async fn claims_for(&self, signals: &[KeyedSignal]) -> Result<Vec<SignalClaim>, StoreError>;

    /// Completion records holding any of the given keys.
    async fn completions_for(&self, keys: &[String]) -> Result<Vec<CompletionRecord>, StoreError>;

    /// Insert a new voter together with claims on its fingerprint signals.
    async fn register_voter(&self, voter: &Voter, claims: &[SignalClaim])
        -> Result<(), StoreError>;

    /// Claim further signals for an existing voter. Signals it already owns are kept.
    async fn bind_signals(&self, voter_id: Id, claims: &[SignalClaim]) -> Result<(), StoreError>;

    /// Replace (or clear) the voter's session.
    async fn set_session(
        &self,
        voter_id: Id,
        session: Option<&SessionRecord>,
    ) -> Result<(), StoreError>;

    /// Record the ballot's position and vote on the voter and insert the ballot.
    async fn commit_vote(
        &self,
        voter_id: Id,
        expected_version: u64,
        ballot: &Ballot,
    ) -> Result<(), StoreError>;

    /// Insert the completion record and claims, and mark the voter completed.
    async fn commit_completion(
        &self,
        voter_id: Id,
        expected_version: u64,
        record: &CompletionRecord,
        claims: &[SignalClaim],
    ) -> Result<(), StoreError>;

    /// Mark every ballot of the voter invalid and clear its votes.
    /// Returns how many ballots flipped.
    async fn commit_invalidation(
        &self,
        voter_id: Id,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Ballots cast from the keyed network since the given time.
    async fn recent_ballots_from_network(
        &self,
        network_key: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Valid ballot counts grouped by position and candidate.
    async fn valid_ballot_counts(&self) -> Result<Vec<BallotCount>, StoreError>;

    /// The seeded candidate roster, in listing order.
    async fn candidates(&self) -> Result<Vec<Candidate>, StoreError>;
}
