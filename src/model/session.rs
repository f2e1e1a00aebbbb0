use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use data_encoding::{BASE64URL_NOPAD, HEXLOWER};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::{
    clock::Clock,
    error::{Error, Result},
    model::{
        db::{SessionRecord, Voter},
        mongodb::Id,
        store::DynStore,
    },
};

/// Length of a session token before encoding.
const TOKEN_BYTES: usize = 32;

/// A freshly issued session. The token is only ever seen here; the store
/// keeps its hash.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies voter session tokens.
pub struct SessionManager {
    store: DynStore,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(store: DynStore, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    /// Start a new session for the voter, replacing any previous one.
    pub async fn issue(&self, voter_id: Id) -> Result<IssuedSession> {
        let mut bytes = [0; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = BASE64URL_NOPAD.encode(&bytes);
        let expires_at = self.clock.now() + self.ttl;

        let record = SessionRecord {
            token_hash: hash_token(&token),
            expires_at,
        };
        self.store.set_session(voter_id, Some(&record)).await?;
        Ok(IssuedSession { token, expires_at })
    }

    /// The voter holding this unexpired token.
    pub async fn verify(&self, institutional_email: &str, token: &str) -> Result<Voter> {
        let email = institutional_email.trim().to_lowercase();
        self.store
            .voter_by_session(&email, &hash_token(token), self.clock.now())
            .await?
            .ok_or(Error::SessionExpired)
    }

    /// End the voter's session, if any.
    pub async fn revoke(&self, voter_id: Id) -> Result<()> {
        self.store.set_session(voter_id, None).await?;
        Ok(())
    }
}

fn hash_token(token: &str) -> String {
    HEXLOWER.encode(&Sha256::digest(token.as_bytes()))
}
