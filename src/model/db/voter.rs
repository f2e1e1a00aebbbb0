use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use mongodb::bson::{serde_helpers::chrono_datetime_as_bson_datetime, to_bson, Bson};
use serde::{Deserialize, Serialize};

use crate::model::{db::candidate::CandidateId, identity::Identity, mongodb::Id};

/// Where a voter is in the voting lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoterStatus {
    /// Signed in, possibly part way through their ballot.
    Active,
    /// Every position voted and the ballot set accepted. Terminal.
    Completed,
    /// Ballots thrown out after a duplicate was detected at completion.
    /// The voter may vote again.
    Invalidated,
}

impl From<VoterStatus> for Bson {
    fn from(status: VoterStatus) -> Self {
        to_bson(&status).expect("Serialisation is infallible")
    }
}

/// The single active session of a voter. Only a hash of the token is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub token_hash: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub expires_at: DateTime<Utc>,
}

/// A vote as remembered on the voter's own record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedVote {
    pub position: String,
    pub candidate_id: CandidateId,
}

/// Core voter data, as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterCore {
    /// Canonical lower case; unique.
    pub institutional_email: String,
    /// Canonical lower case; unique.
    pub personal_email: String,
    pub matric_number: String,
    pub full_name: String,
    /// Keys of every fingerprint signal this voter has been seen with.
    pub fingerprint: Vec<String>,
    pub session: Option<SessionRecord>,
    pub voted_positions: Vec<String>,
    pub votes: Vec<RecordedVote>,
    pub vote_count: u32,
    pub status: VoterStatus,
    /// Bumped by every ballot-affecting write; commits are conditional on it.
    pub version: u64,
}

impl VoterCore {
    /// A freshly signed-in voter with nothing cast yet.
    pub fn new(identity: Identity, fingerprint: Vec<String>) -> Self {
        Self {
            institutional_email: identity.institutional_email,
            personal_email: identity.personal_email,
            matric_number: identity.matric_number,
            full_name: identity.full_name,
            fingerprint,
            session: None,
            voted_positions: Vec::new(),
            votes: Vec::new(),
            vote_count: 0,
            status: VoterStatus::Active,
            version: 0,
        }
    }

    pub fn has_voted(&self, position: &str) -> bool {
        self.voted_positions.iter().any(|p| p == position)
    }

    /// The given positions, in order, minus those already voted.
    pub fn remaining_positions<'a>(
        &self,
        positions: impl IntoIterator<Item = &'a String>,
    ) -> Vec<String> {
        positions
            .into_iter()
            .filter(|p| !self.has_voted(p))
            .cloned()
            .collect()
    }

    /// Apply a cast vote to this record.
    pub fn record_vote(&mut self, position: &str, candidate_id: &str) {
        self.voted_positions.push(position.to_string());
        self.votes.push(RecordedVote {
            position: position.to_string(),
            candidate_id: candidate_id.to_string(),
        });
        self.vote_count += 1;
        self.status = VoterStatus::Active;
        self.version += 1;
    }

    /// Forget every vote after an invalidation.
    pub fn clear_ballot(&mut self) {
        self.voted_positions.clear();
        self.votes.clear();
        self.vote_count = 0;
        self.status = VoterStatus::Invalidated;
        self.version += 1;
    }

    /// Remember any fingerprint keys not already on record.
    pub fn add_fingerprint<'a>(&mut self, keys: impl IntoIterator<Item = &'a String>) {
        for key in keys {
            if !self.fingerprint.contains(key) {
                self.fingerprint.push(key.clone());
            }
        }
    }
}

/// A voter from the database, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voter {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub voter: VoterCore,
}

impl Voter {
    pub fn new(voter: VoterCore) -> Self {
        Self { id: Id::new(), voter }
    }
}

impl Deref for Voter {
    type Target = VoterCore;

    fn deref(&self) -> &Self::Target {
        &self.voter
    }
}

impl DerefMut for Voter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.voter
    }
}

/// Example data for tests.
#[cfg(test)]
mod examples {
    use super::*;

    impl Voter {
        pub fn example() -> Self {
            Self::new(VoterCore::new(Identity::example(), Vec::new()))
        }

        pub fn example2() -> Self {
            Self::new(VoterCore::new(Identity::example2(), Vec::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_positions_keep_roster_order() {
        let mut voter = Voter::example();
        voter.record_vote("Vice President", "c3");
        let positions = ["President", "Vice President", "Treasurer"].map(String::from);
        assert_eq!(
            voter.remaining_positions(&positions),
            vec!["President".to_string(), "Treasurer".to_string()]
        );
    }

    #[test]
    fn clearing_resets_votes_and_bumps_version() {
        let mut voter = Voter::example();
        voter.record_vote("President", "c1");
        voter.clear_ballot();
        assert!(voter.voted_positions.is_empty());
        assert!(voter.votes.is_empty());
        assert_eq!(voter.vote_count, 0);
        assert_eq!(voter.status, VoterStatus::Invalidated);
        assert_eq!(voter.version, 2);
    }
}
