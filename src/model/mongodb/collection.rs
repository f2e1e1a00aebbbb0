use std::ops::Deref;

use log::debug;
use mongodb::{
    bson::{doc, Document},
    error::Error as DbError,
    options::IndexOptions,
    Collection, Database, IndexModel,
};

use crate::model::db::{
    ballot::Ballot, candidate::Candidate, claim::SignalClaim, completion::CompletionRecord,
    voter::Voter,
};

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MongoCollection for Voter {
    const NAME: &'static str = "voters";
}

impl MongoCollection for Ballot {
    const NAME: &'static str = "ballots";
}

impl MongoCollection for SignalClaim {
    const NAME: &'static str = "claims";
}

impl MongoCollection for CompletionRecord {
    const NAME: &'static str = "completions";
}

impl MongoCollection for Candidate {
    const NAME: &'static str = "candidates";
}

/// Names of the unique indexes. Duplicate key errors quote the index name,
/// which is how a refused write is traced back to the rule it broke.
pub mod index_names {
    pub const INSTITUTIONAL_EMAIL: &str = "voter_institutional_email";
    pub const PERSONAL_EMAIL: &str = "voter_personal_email";
    pub const CLAIM_SIGNAL: &str = "claim_signal";
    pub const COMPLETION_VOTER: &str = "completion_voter";
    pub const COMPLETION_KEYS: &str = "completion_keys";
    pub const VALID_BALLOT: &str = "ballot_valid_voter_position";
}

fn unique_index(keys: Document, name: &str) -> IndexModel {
    let options = IndexOptions::builder()
        .unique(true)
        .name(name.to_string())
        .build();
    IndexModel::builder().keys(keys).options(options).build()
}

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    // Voter collection.
    let voters = Coll::<Voter>::from_db(db);
    voters
        .create_index(
            unique_index(
                doc! {"institutional_email": 1},
                index_names::INSTITUTIONAL_EMAIL,
            ),
            None,
        )
        .await?;
    voters
        .create_index(
            unique_index(doc! {"personal_email": 1}, index_names::PERSONAL_EMAIL),
            None,
        )
        .await?;
    voters
        .create_index(IndexModel::builder().keys(doc! {"session.token_hash": 1}).build(), None)
        .await?;

    // Fingerprint claims: one owner per signal.
    Coll::<SignalClaim>::from_db(db)
        .create_index(
            unique_index(doc! {"kind": 1, "key": 1}, index_names::CLAIM_SIGNAL),
            None,
        )
        .await?;

    // Completion records: one per voter, and each key completes at most once.
    let completions = Coll::<CompletionRecord>::from_db(db);
    completions
        .create_index(
            unique_index(doc! {"voter_id": 1}, index_names::COMPLETION_VOTER),
            None,
        )
        .await?;
    let sparse_unique = IndexOptions::builder()
        .unique(true)
        .sparse(true)
        .name(index_names::COMPLETION_KEYS.to_string())
        .build();
    completions
        .create_index(
            IndexModel::builder()
                .keys(doc! {"keys": 1})
                .options(sparse_unique)
                .build(),
            None,
        )
        .await?;

    // Ballot collection: at most one valid ballot per voter and position.
    let ballots = Coll::<Ballot>::from_db(db);
    let valid_only = IndexOptions::builder()
        .unique(true)
        .name(index_names::VALID_BALLOT.to_string())
        .partial_filter_expression(doc! {"valid": true})
        .build();
    ballots
        .create_index(
            IndexModel::builder()
                .keys(doc! {"voter_id": 1, "position": 1})
                .options(valid_only)
                .build(),
            None,
        )
        .await?;
    ballots
        .create_index(
            IndexModel::builder()
                .keys(doc! {"detection.network": 1, "cast_at": 1})
                .build(),
            None,
        )
        .await?;

    Ok(())
}
