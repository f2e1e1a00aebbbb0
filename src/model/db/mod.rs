//! DB-compatible (e.g. de/serialisable) types.
//!
//! The types in this module are serialised in an DB-friendly way, e.g.:
//!
//! - IDs and datetimes are serialised in MongoDB's own format.

pub mod ballot;
pub mod candidate;
pub mod claim;
pub mod completion;
pub mod voter;

pub use ballot::{Ballot, BallotCore, DetectionMetadata};
pub use candidate::{Candidate, CandidateId};
pub use claim::SignalClaim;
pub use completion::CompletionRecord;
pub use voter::{RecordedVote, SessionRecord, Voter, VoterCore, VoterStatus};
