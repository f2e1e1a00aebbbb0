use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::{db::candidate::CandidateId, mongodb::Id};

/// Keyed fingerprint signals seen when the ballot was cast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionMetadata {
    pub network: Option<String>,
    pub device: Option<String>,
}

/// Core ballot data, as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotCore {
    /// Foreign key voter ID.
    pub voter_id: Id,
    pub candidate_id: CandidateId,
    pub position: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub cast_at: DateTime<Utc>,
    /// Cleared if the voter's ballot set is later found fraudulent.
    pub valid: bool,
    pub detection: DetectionMetadata,
}

/// A ballot from the database, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub ballot: BallotCore,
}

impl Ballot {
    /// A new valid ballot.
    pub fn new(
        voter_id: Id,
        candidate_id: &str,
        position: &str,
        cast_at: DateTime<Utc>,
        detection: DetectionMetadata,
    ) -> Self {
        Self {
            id: Id::new(),
            ballot: BallotCore {
                voter_id,
                candidate_id: candidate_id.to_string(),
                position: position.to_string(),
                cast_at,
                valid: true,
                detection,
            },
        }
    }
}

impl Deref for Ballot {
    type Target = BallotCore;

    fn deref(&self) -> &Self::Target {
        &self.ballot
    }
}

impl DerefMut for Ballot {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ballot
    }
}
