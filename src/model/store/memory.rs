use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rocket::tokio::task;

use crate::model::{
    db::{Ballot, Candidate, CompletionRecord, SessionRecord, SignalClaim, Voter, VoterStatus},
    fingerprint::{KeyedSignal, SignalKind},
    mongodb::Id,
};

use super::{BallotCount, Store, StoreError, Violation};

/// All collections, with the unique indexes kept alongside.
#[derive(Default)]
struct MemoryState {
    voters: HashMap<Id, Voter>,
    institutional_emails: HashMap<String, Id>,
    personal_emails: HashMap<String, Id>,
    claims: HashMap<(SignalKind, String), SignalClaim>,
    ballots: Vec<Ballot>,
    completions: HashMap<Id, CompletionRecord>,
    completion_keys: HashMap<String, Id>,
    candidates: Vec<Candidate>,
}

impl MemoryState {
    fn voter_for_commit(&mut self, voter_id: Id, expected_version: u64) -> Result<&mut Voter, StoreError> {
        match self.voters.get_mut(&voter_id) {
            Some(voter) if voter.version == expected_version => Ok(voter),
            _ => Err(StoreError::Conflict),
        }
    }

    /// Fail on the first claim, in the given order, owned by someone else.
    fn check_claims(&self, voter_id: Id, claims: &[SignalClaim]) -> Result<(), StoreError> {
        for claim in claims {
            if let Some(existing) = self.claims.get(&(claim.kind, claim.key.clone())) {
                if existing.voter_id != voter_id {
                    return Err(StoreError::Violation(Violation::Signal(claim.kind)));
                }
            }
        }
        Ok(())
    }

    fn insert_claims(&mut self, claims: &[SignalClaim]) {
        for claim in claims {
            self.claims
                .entry((claim.kind, claim.key.clone()))
                .or_insert_with(|| claim.clone());
        }
    }
}

/// A store held entirely in process memory, for tests and local demos.
///
/// Every operation runs under one short critical section, which plays the
/// part of the database's document-level atomicity. Cloning yields another
/// handle on the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with a candidate roster.
    pub fn with_candidates(candidates: Vec<Candidate>) -> Self {
        let store = Self::new();
        store.lock().candidates = candidates;
        store
    }

    /// Every ballot ever written, valid or not.
    pub fn ballots(&self) -> Vec<Ballot> {
        self.lock().ballots.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give other tasks a chance to run, as a round trip to a real store would.
    async fn round_trip(&self) {
        task::yield_now().await;
    }
}

#[rocket::async_trait]
impl Store for MemoryStore {
    async fn voter_by_id(&self, id: Id) -> Result<Option<Voter>, StoreError> {
        self.round_trip().await;
        Ok(self.lock().voters.get(&id).cloned())
    }

    async fn voter_by_institutional_email(
        &self,
        email: &str,
    ) -> Result<Option<Voter>, StoreError> {
        self.round_trip().await;
        let state = self.lock();
        Ok(state
            .institutional_emails
            .get(email)
            .and_then(|id| state.voters.get(id))
            .cloned())
    }

    async fn voter_by_personal_email(&self, email: &str) -> Result<Option<Voter>, StoreError> {
        self.round_trip().await;
        let state = self.lock();
        Ok(state
            .personal_emails
            .get(email)
            .and_then(|id| state.voters.get(id))
            .cloned())
    }

    async fn voter_by_session(
        &self,
        email: &str,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Voter>, StoreError> {
        self.round_trip().await;
        let state = self.lock();
        let voter = state
            .institutional_emails
            .get(email)
            .and_then(|id| state.voters.get(id))
            .filter(|voter| {
                voter
                    .session
                    .as_ref()
                    .map_or(false, |s| s.token_hash == token_hash && s.expires_at > now)
            });
        Ok(voter.cloned())
    }

    async fn claims_for(&self, signals: &[KeyedSignal]) -> Result<Vec<SignalClaim>, StoreError> {
        self.round_trip().await;
        let state = self.lock();
        Ok(signals
            .iter()
            .filter_map(|s| state.claims.get(&(s.kind, s.key.clone())))
            .cloned()
            .collect())
    }

    async fn completions_for(&self, keys: &[String]) -> Result<Vec<CompletionRecord>, StoreError> {
        self.round_trip().await;
        let state = self.lock();
        let mut owners = keys
            .iter()
            .filter_map(|key| state.completion_keys.get(key))
            .collect::<Vec<_>>();
        owners.sort();
        owners.dedup();
        Ok(owners
            .into_iter()
            .filter_map(|id| state.completions.get(id))
            .cloned()
            .collect())
    }

    async fn register_voter(&self, voter: &Voter, claims: &[SignalClaim]) -> Result<(), StoreError> {
        self.round_trip().await;
        let mut state = self.lock();
        if state.institutional_emails.contains_key(&voter.institutional_email) {
            return Err(StoreError::Violation(Violation::InstitutionalEmail));
        }
        if state.personal_emails.contains_key(&voter.personal_email) {
            return Err(StoreError::Violation(Violation::PersonalEmail));
        }
        state.check_claims(voter.id, claims)?;

        state
            .institutional_emails
            .insert(voter.institutional_email.clone(), voter.id);
        state
            .personal_emails
            .insert(voter.personal_email.clone(), voter.id);
        state.insert_claims(claims);
        state.voters.insert(voter.id, voter.clone());
        Ok(())
    }

    async fn bind_signals(&self, voter_id: Id, claims: &[SignalClaim]) -> Result<(), StoreError> {
        self.round_trip().await;
        let mut state = self.lock();
        if !state.voters.contains_key(&voter_id) {
            return Err(StoreError::Conflict);
        }
        state.check_claims(voter_id, claims)?;
        state.insert_claims(claims);
        if let Some(voter) = state.voters.get_mut(&voter_id) {
            voter.add_fingerprint(claims.iter().map(|c| &c.key));
        }
        Ok(())
    }

    async fn set_session(
        &self,
        voter_id: Id,
        session: Option<&SessionRecord>,
    ) -> Result<(), StoreError> {
        self.round_trip().await;
        let mut state = self.lock();
        let voter = state.voters.get_mut(&voter_id).ok_or(StoreError::Conflict)?;
        voter.session = session.cloned();
        Ok(())
    }

    async fn commit_vote(
        &self,
        voter_id: Id,
        expected_version: u64,
        ballot: &Ballot,
    ) -> Result<(), StoreError> {
        self.round_trip().await;
        let mut state = self.lock();
        let duplicate = state
            .ballots
            .iter()
            .any(|b| b.valid && b.voter_id == voter_id && b.position == ballot.position);
        let voter = state.voter_for_commit(voter_id, expected_version)?;
        if voter.status == VoterStatus::Completed || voter.has_voted(&ballot.position) {
            return Err(StoreError::Conflict);
        }
        if duplicate {
            return Err(StoreError::Violation(Violation::ValidBallot));
        }
        voter.record_vote(&ballot.position, &ballot.candidate_id);
        state.ballots.push(ballot.clone());
        Ok(())
    }

    async fn commit_completion(
        &self,
        voter_id: Id,
        expected_version: u64,
        record: &CompletionRecord,
        claims: &[SignalClaim],
    ) -> Result<(), StoreError> {
        self.round_trip().await;
        let mut state = self.lock();
        let voter = state.voter_for_commit(voter_id, expected_version)?;
        if voter.status == VoterStatus::Completed {
            return Err(StoreError::Conflict);
        }
        if state.completions.contains_key(&voter_id) {
            return Err(StoreError::Conflict);
        }
        let taken = record
            .keys
            .iter()
            .any(|key| matches!(state.completion_keys.get(key), Some(owner) if *owner != voter_id));
        if taken {
            return Err(StoreError::Violation(Violation::CompletionKey));
        }
        state.check_claims(voter_id, claims)?;

        for key in &record.keys {
            state.completion_keys.insert(key.clone(), voter_id);
        }
        state.completions.insert(voter_id, record.clone());
        state.insert_claims(claims);
        let voter = state.voter_for_commit(voter_id, expected_version)?;
        voter.add_fingerprint(&record.keys);
        voter.status = VoterStatus::Completed;
        voter.version += 1;
        Ok(())
    }

    async fn commit_invalidation(
        &self,
        voter_id: Id,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        self.round_trip().await;
        let mut state = self.lock();
        state.voter_for_commit(voter_id, expected_version)?.clear_ballot();
        let mut flipped = 0;
        for ballot in state.ballots.iter_mut() {
            if ballot.voter_id == voter_id && ballot.valid {
                ballot.valid = false;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn recent_ballots_from_network(
        &self,
        network_key: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.round_trip().await;
        let state = self.lock();
        let count = state
            .ballots
            .iter()
            .filter(|b| {
                b.valid && b.detection.network.as_deref() == Some(network_key) && b.cast_at >= since
            })
            .count();
        Ok(count as u64)
    }

    async fn valid_ballot_counts(&self) -> Result<Vec<BallotCount>, StoreError> {
        self.round_trip().await;
        let state = self.lock();
        let mut counts: HashMap<(&str, &str), u64> = HashMap::new();
        for ballot in state.ballots.iter().filter(|b| b.valid) {
            *counts
                .entry((ballot.position.as_str(), ballot.candidate_id.as_str()))
                .or_default() += 1;
        }
        let mut counts = counts
            .into_iter()
            .map(|((position, candidate_id), count)| BallotCount {
                position: position.to_string(),
                candidate_id: candidate_id.to_string(),
                count,
            })
            .collect::<Vec<_>>();
        counts.sort_by(|a, b| {
            (&a.position, &a.candidate_id).cmp(&(&b.position, &b.candidate_id))
        });
        Ok(counts)
    }

    async fn candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        self.round_trip().await;
        let mut candidates = self.lock().candidates.clone();
        candidates.sort_by_key(|c| c.order);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::model::db::DetectionMetadata;

    use super::*;

    fn claim(kind: SignalKind, key: &str, voter_id: Id) -> SignalClaim {
        SignalClaim {
            kind,
            key: key.to_string(),
            voter_id,
            network: None,
        }
    }

    #[rocket::async_test]
    async fn register_enforces_unique_identity() {
        let store = MemoryStore::new();
        let voter = Voter::example();
        store.register_voter(&voter, &[]).await.unwrap();

        let mut same_personal = Voter::example2();
        same_personal.personal_email = voter.personal_email.clone();
        let err = store.register_voter(&same_personal, &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::Violation(Violation::PersonalEmail)));

        let mut same_institutional = Voter::example2();
        same_institutional.institutional_email = voter.institutional_email.clone();
        let err = store.register_voter(&same_institutional, &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::Violation(Violation::InstitutionalEmail)));
    }

    #[rocket::async_test]
    async fn claims_are_insert_if_absent() {
        let store = MemoryStore::new();
        let a = Voter::example();
        let b = Voter::example2();
        store
            .register_voter(&a, &[claim(SignalKind::Network, "net", a.id)])
            .await
            .unwrap();

        // Re-binding its own signal is fine.
        store
            .bind_signals(a.id, &[claim(SignalKind::Network, "net", a.id)])
            .await
            .unwrap();

        // Another voter cannot take it, and nothing of theirs is written.
        let err = store
            .register_voter(&b, &[claim(SignalKind::Network, "net", b.id)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Violation(Violation::Signal(SignalKind::Network))));
        assert!(store.voter_by_id(b.id).await.unwrap().is_none());
    }

    #[rocket::async_test]
    async fn stale_version_conflicts() {
        let store = MemoryStore::new();
        let voter = Voter::example();
        store.register_voter(&voter, &[]).await.unwrap();

        let ballot = Ballot::new(voter.id, "c1", "President", Utc::now(), DetectionMetadata::default());
        store.commit_vote(voter.id, 0, &ballot).await.unwrap();

        let again = Ballot::new(voter.id, "c3", "Vice President", Utc::now(), DetectionMetadata::default());
        let err = store.commit_vote(voter.id, 0, &again).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
        store.commit_vote(voter.id, 1, &again).await.unwrap();

        let stored = store.voter_by_id(voter.id).await.unwrap().unwrap();
        assert_eq!(stored.voted_positions, vec!["President", "Vice President"]);
        assert_eq!(stored.vote_count, 2);
        assert_eq!(stored.version, 2);
    }

    #[rocket::async_test]
    async fn session_lookup_checks_hash_and_expiry() {
        let store = MemoryStore::new();
        let voter = Voter::example();
        store.register_voter(&voter, &[]).await.unwrap();
        let now = Utc::now();
        let session = SessionRecord {
            token_hash: "hash".to_string(),
            expires_at: now + Duration::minutes(5),
        };
        store.set_session(voter.id, Some(&session)).await.unwrap();

        let email = &voter.institutional_email;
        assert!(store.voter_by_session(email, "hash", now).await.unwrap().is_some());
        assert!(store.voter_by_session(email, "other", now).await.unwrap().is_none());
        let later = now + Duration::minutes(5);
        assert!(store.voter_by_session(email, "hash", later).await.unwrap().is_none());
    }

    #[rocket::async_test]
    async fn network_rate_counts_only_valid_ballots() {
        let store = MemoryStore::new();
        let voter = Voter::example();
        store.register_voter(&voter, &[]).await.unwrap();
        let detection = DetectionMetadata {
            network: Some("net".to_string()),
            device: None,
        };
        let since = Utc::now() - Duration::minutes(10);

        let ballot = Ballot::new(voter.id, "c1", "President", Utc::now(), detection.clone());
        store.commit_vote(voter.id, 0, &ballot).await.unwrap();
        assert_eq!(store.recent_ballots_from_network("net", since).await.unwrap(), 1);

        assert_eq!(store.commit_invalidation(voter.id, 1).await.unwrap(), 1);
        assert_eq!(store.recent_ballots_from_network("net", since).await.unwrap(), 0);

        let revote = Ballot::new(voter.id, "c2", "President", Utc::now(), detection);
        store.commit_vote(voter.id, 2, &revote).await.unwrap();
        assert_eq!(store.recent_ballots_from_network("net", since).await.unwrap(), 1);
        assert_eq!(store.recent_ballots_from_network("other", since).await.unwrap(), 0);
    }
}
