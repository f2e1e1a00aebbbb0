use serde::{Deserialize, Serialize};

use crate::model::{api::session::SessionCredentials, db::CandidateId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    #[serde(flatten)]
    pub session: SessionCredentials,
    pub candidate_id: CandidateId,
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReceipt {
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReceipt {
    pub completed: bool,
}
