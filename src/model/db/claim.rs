use serde::{Deserialize, Serialize};

use crate::model::{fingerprint::SignalKind, mongodb::Id};

/// Binds one keyed fingerprint signal to the voter who first presented it.
/// `(kind, key)` is unique, so claiming is an insert-if-absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalClaim {
    pub kind: SignalKind,
    pub key: String,
    pub voter_id: Id,
    /// Keyed network the signal was first seen from, if known.
    pub network: Option<String>,
}
