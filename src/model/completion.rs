use std::sync::Arc;

use log::{info, warn};

use crate::{
    clock::Clock,
    error::{Error, Result},
    model::{
        db::{CompletionRecord, Voter, VoterStatus},
        guard::{Decision, DuplicateGuard, Screening},
        mongodb::Id,
        roster::Roster,
        store::{DynStore, StoreError},
        transaction::retry_on_conflict,
    },
};

/// Finalises a voter's ballot set once every position has been voted.
pub struct CompletionGuard {
    store: DynStore,
    guard: Arc<DuplicateGuard>,
    roster: Arc<Roster>,
    clock: Arc<dyn Clock>,
    retries: usize,
}

impl CompletionGuard {
    pub fn new(
        store: DynStore,
        guard: Arc<DuplicateGuard>,
        roster: Arc<Roster>,
        clock: Arc<dyn Clock>,
        retries: usize,
    ) -> Self {
        Self {
            store,
            guard,
            roster,
            clock,
            retries,
        }
    }

    /// Complete the voter's ballot set from the given fingerprint.
    ///
    /// If the duplicate check fails, every ballot of the voter is invalidated
    /// and `DuplicateCompletion` is returned; the voter may then vote again.
    /// Completing an already completed voter succeeds without change.
    pub async fn complete(&self, voter_id: Id, screening: &Screening) -> Result<()> {
        retry_on_conflict(self.retries, || self.attempt(voter_id, screening)).await
    }

    async fn load(&self, voter_id: Id) -> Result<Voter> {
        self.store
            .voter_by_id(voter_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Voter with ID '{voter_id}'")))
    }

    async fn attempt(&self, voter_id: Id, screening: &Screening) -> Result<()> {
        let voter = self.load(voter_id).await?;
        if voter.status == VoterStatus::Completed {
            return Ok(());
        }

        let required = self.roster.positions().len();
        let remaining = voter.remaining_positions(self.roster.positions()).len();
        if remaining > 0 {
            return Err(Error::IncompleteBallot {
                voted: required - remaining,
                required,
            });
        }

        if let Decision::Block(block) = self.guard.check_completion(&voter, screening).await? {
            return Err(self.reject(&voter, Error::from(block)).await?);
        }

        let record = CompletionRecord {
            voter_id: voter.id,
            keys: screening.keys(),
            completed_at: self.clock.now(),
        };
        let claims = self.guard.claims(voter.id, screening);
        match self
            .store
            .commit_completion(voter.id, voter.version, &record, &claims)
            .await
        {
            Ok(()) => {
                info!("Voter {} completed their ballot", voter.id);
                Ok(())
            }
            Err(StoreError::Violation(violation)) => match Error::from(violation) {
                Error::TransactionConflict => Err(Error::TransactionConflict),
                cause => Err(self.reject(&voter, cause).await?),
            },
            Err(err) => Err(err.into()),
        }
    }

    /// Throw out the voter's ballots and produce the error reporting why.
    async fn reject(&self, voter: &Voter, cause: Error) -> Result<Error> {
        let invalidated = self.invalidate(voter).await?;
        warn!(
            "Invalidated {invalidated} ballot(s) of voter {} at completion: {cause}",
            voter.id
        );
        Ok(Error::DuplicateCompletion(cause.to_string()))
    }

    /// Invalidate the voter's ballots and clear their votes. Returns how many
    /// ballots were invalidated. Invalidating twice is the same as once, and
    /// completed voters are left alone.
    async fn invalidate(&self, voter: &Voter) -> Result<u64> {
        let settled = voter.status == VoterStatus::Invalidated && voter.vote_count == 0;
        if settled || voter.status == VoterStatus::Completed {
            return Ok(0);
        }
        Ok(self
            .store
            .commit_invalidation(voter.id, voter.version)
            .await?)
    }
}
