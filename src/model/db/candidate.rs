use serde::{Deserialize, Serialize};

pub type CandidateId = String;

/// A contestant for one position. Seeded outside this service and never
/// modified by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(rename = "_id")]
    pub id: CandidateId,
    pub name: String,
    pub position: String,
    /// Position in the roster listing; ties in the tally keep this order.
    #[serde(default)]
    pub order: u32,
}
