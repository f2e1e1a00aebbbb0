//! API-compatible types.
//!
//! The types in this module are serialised in an API-friendly way, e.g.
//! datetimes are serialised as timestamps.

pub mod candidate;
pub mod session;
pub mod vote;
