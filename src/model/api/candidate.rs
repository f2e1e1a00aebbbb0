use serde::{Deserialize, Serialize};

use crate::model::db::{Candidate, CandidateId};

/// A candidate as listed to voters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateView {
    pub id: CandidateId,
    pub name: String,
    pub position: String,
}

impl From<&Candidate> for CandidateView {
    fn from(candidate: &Candidate) -> Self {
        Self {
            id: candidate.id.clone(),
            name: candidate.name.clone(),
            position: candidate.position.clone(),
        }
    }
}
