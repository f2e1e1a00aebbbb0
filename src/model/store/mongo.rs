use chrono::{DateTime, Utc};
use log::warn;
use mongodb::{
    bson::{self, doc, Document},
    error::Error as DbError,
    options::{Acknowledgment, FindOptions, ReadConcern, TransactionOptions, WriteConcern},
    Client, ClientSession, Database,
};
use rocket::futures::TryStreamExt;
use serde::Deserialize;

use crate::model::{
    db::{Ballot, Candidate, CompletionRecord, SessionRecord, SignalClaim, Voter, VoterStatus},
    fingerprint::KeyedSignal,
    mongodb::{errors, Coll, Id},
};

use super::{BallotCount, Store, StoreError, Violation};

/// How many times to re-send a commit whose outcome the server could not report.
const COMMIT_RETRIES: usize = 3;

/// A store backed by MongoDB. Multi-document commits run as transactions,
/// so the deployment must be a replica set.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    voters: Coll<Voter>,
    ballots: Coll<Ballot>,
    claims: Coll<SignalClaim>,
    completions: Coll<CompletionRecord>,
    candidates: Coll<Candidate>,
}

impl MongoStore {
    /// Use the given database, whose indexes must already exist.
    pub fn new(client: Client, db: &Database) -> Self {
        Self {
            client,
            voters: Coll::from_db(db),
            ballots: Coll::from_db(db),
            claims: Coll::from_db(db),
            completions: Coll::from_db(db),
            candidates: Coll::from_db(db),
        }
    }

    async fn start_transaction(&self) -> Result<ClientSession, StoreError> {
        let mut session = self.client.start_session(None).await?;
        let options = TransactionOptions::builder()
            .read_concern(ReadConcern::snapshot())
            .write_concern(WriteConcern::builder().w(Acknowledgment::Majority).build())
            .build();
        session.start_transaction(options).await?;
        Ok(session)
    }

    /// Insert each claim that does not exist yet, failing if any is held by another voter.
    async fn claim_signals(
        &self,
        voter_id: Id,
        claims: &[SignalClaim],
        session: &mut ClientSession,
    ) -> Result<(), StoreError> {
        for claim in claims {
            let filter = doc! { "kind": claim.kind, "key": &claim.key };
            match self
                .claims
                .find_one_with_session(filter, None, session)
                .await?
            {
                Some(existing) if existing.voter_id != voter_id => {
                    return Err(StoreError::Violation(Violation::Signal(claim.kind)));
                }
                Some(_) => {}
                None => {
                    self.claims
                        .insert_one_with_session(claim, None, session)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn register_in(
        &self,
        voter: &Voter,
        claims: &[SignalClaim],
        session: &mut ClientSession,
    ) -> Result<(), StoreError> {
        self.voters
            .insert_one_with_session(voter, None, session)
            .await?;
        self.claim_signals(voter.id, claims, session).await
    }

    async fn bind_in(
        &self,
        voter_id: Id,
        claims: &[SignalClaim],
        session: &mut ClientSession,
    ) -> Result<(), StoreError> {
        self.claim_signals(voter_id, claims, session).await?;
        let keys = claims.iter().map(|c| c.key.clone()).collect::<Vec<_>>();
        let update = doc! { "$addToSet": { "fingerprint": { "$each": keys } } };
        let result = self
            .voters
            .update_one_with_session(voter_id.as_doc(), update, None, session)
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::Conflict);
        }
        Ok(())
    }

    async fn vote_in(
        &self,
        voter_id: Id,
        expected_version: u64,
        ballot: &Ballot,
        session: &mut ClientSession,
    ) -> Result<(), StoreError> {
        let filter = doc! {
            "_id": voter_id,
            "version": expected_version as i64,
            "status": { "$ne": VoterStatus::Completed },
            "voted_positions": { "$ne": &ballot.position },
        };
        let update = doc! {
            "$push": {
                "voted_positions": &ballot.position,
                "votes": { "position": &ballot.position, "candidate_id": &ballot.candidate_id },
            },
            "$inc": { "vote_count": 1, "version": 1 },
            "$set": { "status": VoterStatus::Active },
        };
        let result = self
            .voters
            .update_one_with_session(filter, update, None, session)
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::Conflict);
        }
        self.ballots
            .insert_one_with_session(ballot, None, session)
            .await?;
        Ok(())
    }

    async fn complete_in(
        &self,
        voter_id: Id,
        expected_version: u64,
        record: &CompletionRecord,
        claims: &[SignalClaim],
        session: &mut ClientSession,
    ) -> Result<(), StoreError> {
        let filter = doc! {
            "_id": voter_id,
            "version": expected_version as i64,
            "status": { "$ne": VoterStatus::Completed },
        };
        let update = doc! {
            "$set": { "status": VoterStatus::Completed },
            "$inc": { "version": 1 },
            "$addToSet": { "fingerprint": { "$each": record.keys.clone() } },
        };
        let result = self
            .voters
            .update_one_with_session(filter, update, None, session)
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::Conflict);
        }
        self.completions
            .insert_one_with_session(record, None, session)
            .await?;
        self.claim_signals(voter_id, claims, session).await
    }

    async fn invalidate_in(
        &self,
        voter_id: Id,
        expected_version: u64,
        session: &mut ClientSession,
    ) -> Result<u64, StoreError> {
        let filter = doc! { "_id": voter_id, "version": expected_version as i64 };
        let update = doc! {
            "$set": {
                "voted_positions": [],
                "votes": [],
                "vote_count": 0_i64,
                "status": VoterStatus::Invalidated,
            },
            "$inc": { "version": 1 },
        };
        let result = self
            .voters
            .update_one_with_session(filter, update, None, session)
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::Conflict);
        }
        let result = self
            .ballots
            .update_many_with_session(
                doc! { "voter_id": voter_id, "valid": true },
                doc! { "$set": { "valid": false } },
                None,
                session,
            )
            .await?;
        Ok(result.modified_count)
    }
}

/// Commit the transaction if `result` is a success, otherwise abort it.
async fn finish<T>(
    mut session: ClientSession,
    result: Result<T, StoreError>,
) -> Result<T, StoreError> {
    let value = match result {
        Ok(value) => value,
        Err(err) => {
            if let Err(e) = session.abort_transaction().await {
                warn!("Failed to abort transaction: {e}");
            }
            return Err(err);
        }
    };
    let mut attempts = 0;
    loop {
        match session.commit_transaction().await {
            Ok(()) => return Ok(value),
            Err(e) if errors::is_unknown_commit_result(&e) && attempts < COMMIT_RETRIES => {
                attempts += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// One `$group` output row of the tally aggregation.
#[derive(Deserialize)]
struct CountGroup {
    #[serde(rename = "_id")]
    key: CountKey,
    count: u64,
}

#[derive(Deserialize)]
struct CountKey {
    position: String,
    candidate_id: String,
}

#[rocket::async_trait]
impl Store for MongoStore {
    async fn voter_by_id(&self, id: Id) -> Result<Option<Voter>, StoreError> {
        Ok(self.voters.find_one(id.as_doc(), None).await?)
    }

    async fn voter_by_institutional_email(
        &self,
        email: &str,
    ) -> Result<Option<Voter>, StoreError> {
        let filter = doc! { "institutional_email": email };
        Ok(self.voters.find_one(filter, None).await?)
    }

    async fn voter_by_personal_email(&self, email: &str) -> Result<Option<Voter>, StoreError> {
        let filter = doc! { "personal_email": email };
        Ok(self.voters.find_one(filter, None).await?)
    }

    async fn voter_by_session(
        &self,
        email: &str,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Voter>, StoreError> {
        let filter = doc! {
            "institutional_email": email,
            "session.token_hash": token_hash,
            "session.expires_at": { "$gt": bson::DateTime::from_chrono(now) },
        };
        Ok(self.voters.find_one(filter, None).await?)
    }

    async fn claims_for(&self, signals: &[KeyedSignal]) -> Result<Vec<SignalClaim>, StoreError> {
        if signals.is_empty() {
            return Ok(Vec::new());
        }
        let any_of = signals
            .iter()
            .map(|s| doc! { "kind": s.kind, "key": &s.key })
            .collect::<Vec<Document>>();
        let claims = self
            .claims
            .find(doc! { "$or": any_of }, None)
            .await?
            .try_collect()
            .await?;
        Ok(claims)
    }

    async fn completions_for(&self, keys: &[String]) -> Result<Vec<CompletionRecord>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let records = self
            .completions
            .find(doc! { "keys": { "$in": keys } }, None)
            .await?
            .try_collect()
            .await?;
        Ok(records)
    }

    async fn register_voter(&self, voter: &Voter, claims: &[SignalClaim]) -> Result<(), StoreError> {
        let mut session = self.start_transaction().await?;
        let result = self.register_in(voter, claims, &mut session).await;
        finish(session, result).await
    }

    async fn bind_signals(&self, voter_id: Id, claims: &[SignalClaim]) -> Result<(), StoreError> {
        let mut session = self.start_transaction().await?;
        let result = self.bind_in(voter_id, claims, &mut session).await;
        finish(session, result).await
    }

    async fn set_session(
        &self,
        voter_id: Id,
        session: Option<&SessionRecord>,
    ) -> Result<(), StoreError> {
        let value = match session {
            Some(s) => bson::to_bson(s).map_err(DbError::from)?,
            None => bson::Bson::Null,
        };
        let result = self
            .voters
            .update_one(voter_id.as_doc(), doc! { "$set": { "session": value } }, None)
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::Conflict);
        }
        Ok(())
    }

    async fn commit_vote(
        &self,
        voter_id: Id,
        expected_version: u64,
        ballot: &Ballot,
    ) -> Result<(), StoreError> {
        let mut session = self.start_transaction().await?;
        let result = self
            .vote_in(voter_id, expected_version, ballot, &mut session)
            .await;
        finish(session, result).await
    }

    async fn commit_completion(
        &self,
        voter_id: Id,
        expected_version: u64,
        record: &CompletionRecord,
        claims: &[SignalClaim],
    ) -> Result<(), StoreError> {
        let mut session = self.start_transaction().await?;
        let result = self
            .complete_in(voter_id, expected_version, record, claims, &mut session)
            .await;
        finish(session, result).await
    }

    async fn commit_invalidation(
        &self,
        voter_id: Id,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut session = self.start_transaction().await?;
        let result = self
            .invalidate_in(voter_id, expected_version, &mut session)
            .await;
        finish(session, result).await
    }

    async fn recent_ballots_from_network(
        &self,
        network_key: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let filter = doc! {
            "detection.network": network_key,
            "valid": true,
            "cast_at": { "$gte": bson::DateTime::from_chrono(since) },
        };
        Ok(self.ballots.count_documents(filter, None).await?)
    }

    async fn valid_ballot_counts(&self) -> Result<Vec<BallotCount>, StoreError> {
        let pipeline = [
            doc! { "$match": { "valid": true } },
            doc! {
                "$group": {
                    "_id": { "position": "$position", "candidate_id": "$candidate_id" },
                    "count": { "$sum": 1 },
                }
            },
            doc! { "$sort": { "_id.position": 1, "_id.candidate_id": 1 } },
        ];
        let groups = self
            .ballots
            .aggregate(pipeline, None)
            .await?
            .try_collect::<Vec<Document>>()
            .await?;
        groups
            .into_iter()
            .map(|group| {
                let group: CountGroup = bson::from_document(group).map_err(DbError::from)?;
                Ok(BallotCount {
                    position: group.key.position,
                    candidate_id: group.key.candidate_id,
                    count: group.count,
                })
            })
            .collect()
    }

    async fn candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        let options = FindOptions::builder().sort(doc! { "order": 1 }).build();
        let candidates = self
            .candidates
            .find(None, options)
            .await?
            .try_collect()
            .await?;
        Ok(candidates)
    }
}
