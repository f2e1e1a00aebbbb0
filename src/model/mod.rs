pub mod api;
pub mod ballot;
pub mod completion;
pub mod db;
pub mod fingerprint;
pub mod guard;
pub mod identity;
pub mod mongodb;
pub mod roster;
pub mod session;
pub mod store;
pub mod tally;
pub mod transaction;
