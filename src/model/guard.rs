//! Duplicate voter detection.
//!
//! The guard reads the store to decide early whether a sign-in or completion
//! should be refused. The decisive check is the store's unique claim index:
//! a write that would give a signal a second owner fails there regardless of
//! what the read saw.

use log::warn;

use crate::{
    error::{Error, Result},
    model::{
        db::{SignalClaim, Voter},
        fingerprint::{
            device_signature, DetectionStrategy, Fingerprint, KeyedSignal, Signal, SignalKeyer,
            SignalKind,
        },
        identity::Identity,
        mongodb::Id,
        store::DynStore,
    },
};

/// The outcome of a duplicate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block(Block),
}

/// Why a voter was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    /// The identity belongs to, or clashes with, another student's record.
    Identity(String),
    /// A fingerprint signal is claimed by another voter.
    Signal(SignalKind),
    /// Another voter already completed a ballot from this fingerprint.
    CompletedElsewhere,
}

impl From<Block> for Error {
    fn from(block: Block) -> Self {
        match block {
            Block::Identity(reason) => Error::DuplicateIdentity(reason),
            Block::Signal(kind) => kind.block_error(),
            Block::CompletedElsewhere => Error::DuplicateDevice(
                "this device has already completed a ballot".to_string(),
            ),
        }
    }
}

/// The keyed signals derived from one request's fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Screening {
    /// In the order the guard checks them.
    pub signals: Vec<KeyedSignal>,
    /// Keyed network, for rate limiting and ballot metadata.
    pub network_key: Option<String>,
    /// Keyed device signature, for ballot metadata.
    pub device_key: Option<String>,
}

impl Screening {
    /// The keys of every signal, as recorded on completion.
    pub fn keys(&self) -> Vec<String> {
        self.signals.iter().map(|s| s.key.clone()).collect()
    }
}

pub struct DuplicateGuard {
    store: DynStore,
    keyer: SignalKeyer,
    strategy: Box<dyn DetectionStrategy>,
}

impl DuplicateGuard {
    pub fn new(store: DynStore, keyer: SignalKeyer, strategy: Box<dyn DetectionStrategy>) -> Self {
        Self {
            store,
            keyer,
            strategy,
        }
    }

    pub fn strategy(&self) -> &dyn DetectionStrategy {
        self.strategy.as_ref()
    }

    /// Derive and key the signals of a fingerprint under the configured strategy.
    pub fn screen(&self, fingerprint: &Fingerprint) -> Screening {
        let mut signals = self
            .strategy
            .signals(fingerprint)
            .iter()
            .map(|signal| self.keyer.key(signal))
            .collect::<Vec<_>>();
        signals.sort_by_key(|s| s.kind);

        let network_key = fingerprint
            .network
            .as_ref()
            .map(|network| self.keyer.key(&Signal::new(SignalKind::Network, network.as_str())).key);
        let device_key = device_signature(fingerprint)
            .map(|device| self.keyer.key(&Signal::new(SignalKind::DeviceSignature, device)).key);
        Screening {
            signals,
            network_key,
            device_key,
        }
    }

    /// Claims binding every screened signal to the voter.
    pub fn claims(&self, voter_id: Id, screening: &Screening) -> Vec<SignalClaim> {
        screening
            .signals
            .iter()
            .map(|signal| SignalClaim {
                kind: signal.kind,
                key: signal.key.clone(),
                voter_id,
                network: screening.network_key.clone(),
            })
            .collect()
    }

    /// Decide whether a sign-in may proceed. `existing` is the record already
    /// held under the identity's institutional email, if any.
    pub async fn check(
        &self,
        identity: &Identity,
        existing: Option<&Voter>,
        screening: &Screening,
    ) -> Result<Decision> {
        if let Some(other) = self
            .store
            .voter_by_personal_email(&identity.personal_email)
            .await?
        {
            if other.institutional_email != identity.institutional_email {
                return Ok(self.block(Block::Identity(
                    "personal email is already registered to another student".to_string(),
                )));
            }
        }
        if let Some(voter) = existing {
            if voter.personal_email != identity.personal_email
                || voter.matric_number != identity.matric_number
            {
                return Ok(self.block(Block::Identity(
                    "institutional email is registered with different details".to_string(),
                )));
            }
        }

        self.check_signals(existing.map(|v| v.id), screening).await
    }

    /// Decide whether a voter may complete, given the completion fingerprint.
    /// Also refuses when another voter completed from any of the same signals.
    pub async fn check_completion(&self, voter: &Voter, screening: &Screening) -> Result<Decision> {
        if let Some(other) = self
            .store
            .voter_by_personal_email(&voter.personal_email)
            .await?
        {
            if other.id != voter.id {
                return Ok(self.block(Block::Identity(
                    "personal email is already registered to another student".to_string(),
                )));
            }
        }

        if let Decision::Block(block) = self.check_signals(Some(voter.id), screening).await? {
            return Ok(Decision::Block(block));
        }

        let completed_elsewhere = self
            .store
            .completions_for(&screening.keys())
            .await?
            .iter()
            .any(|record| record.voter_id != voter.id);
        if completed_elsewhere {
            return Ok(self.block(Block::CompletedElsewhere));
        }
        Ok(Decision::Allow)
    }

    /// Block on the first signal, in priority order, claimed by someone other than `owner`.
    async fn check_signals(&self, owner: Option<Id>, screening: &Screening) -> Result<Decision> {
        let claims = self.store.claims_for(&screening.signals).await?;
        for signal in &screening.signals {
            let taken = claims.iter().find(|claim| {
                claim.kind == signal.kind
                    && claim.key == signal.key
                    && Some(claim.voter_id) != owner
            });
            if let Some(claim) = taken {
                // The same device on the same network is an exact device match.
                let kind = if signal.kind == SignalKind::DeviceSignature
                    && claim.network.is_some()
                    && claim.network == screening.network_key
                {
                    SignalKind::Device
                } else {
                    signal.kind
                };
                return Ok(self.block(Block::Signal(kind)));
            }
        }
        Ok(Decision::Allow)
    }

    fn block(&self, block: Block) -> Decision {
        warn!(
            "Duplicate check ({}) refused voter: {}",
            self.strategy.name(),
            Error::from(block.clone())
        );
        Decision::Block(block)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use crate::model::{
        db::CompletionRecord,
        fingerprint::{DeviceStrategy, NetworkStrategy, StrategyKind},
        store::{MemoryStore, Store},
    };

    use super::*;

    fn guard(store: &MemoryStore, strategy: StrategyKind) -> DuplicateGuard {
        DuplicateGuard::new(
            Arc::new(store.clone()),
            SignalKeyer::new("secret"),
            strategy.strategy(),
        )
    }

    /// Register the example voter as seen from the given fingerprint.
    async fn register(store: &MemoryStore, guard: &DuplicateGuard, fingerprint: &Fingerprint) -> Voter {
        let voter = Voter::example();
        let screening = guard.screen(fingerprint);
        store
            .register_voter(&voter, &guard.claims(voter.id, &screening))
            .await
            .unwrap();
        voter
    }

    #[rocket::async_test]
    async fn fresh_voter_is_allowed() {
        let store = MemoryStore::new();
        let guard = guard(&store, StrategyKind::Composite);
        let screening = guard.screen(&Fingerprint::example());
        let decision = guard.check(&Identity::example(), None, &screening).await.unwrap();
        assert_eq!(decision, Decision::Allow);
    }

    #[rocket::async_test]
    async fn returning_voter_is_never_blocked_by_own_record() {
        let store = MemoryStore::new();
        let guard = guard(&store, StrategyKind::Composite);
        let voter = register(&store, &guard, &Fingerprint::example()).await;
        let screening = guard.screen(&Fingerprint::example());
        let decision = guard
            .check(&Identity::example(), Some(&voter), &screening)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Allow);
    }

    #[rocket::async_test]
    async fn personal_email_of_another_student_is_refused() {
        let store = MemoryStore::new();
        let guard = guard(&store, StrategyKind::Composite);
        register(&store, &guard, &Fingerprint::example()).await;

        let mut impostor = Identity::example2();
        impostor.personal_email = Identity::example().personal_email;
        let screening = guard.screen(&Fingerprint::example2());
        let decision = guard.check(&impostor, None, &screening).await.unwrap();
        assert!(matches!(decision, Decision::Block(Block::Identity(_))));
    }

    #[rocket::async_test]
    async fn changed_details_for_existing_record_are_refused() {
        let store = MemoryStore::new();
        let guard = guard(&store, StrategyKind::Composite);
        let voter = register(&store, &guard, &Fingerprint::example()).await;

        let mut changed = Identity::example();
        changed.personal_email = "someone.else@mail.com".to_string();
        let screening = guard.screen(&Fingerprint::example());
        let decision = guard.check(&changed, Some(&voter), &screening).await.unwrap();
        assert!(matches!(decision, Decision::Block(Block::Identity(_))));
    }

    #[rocket::async_test]
    async fn signals_are_checked_in_priority_order() {
        let store = MemoryStore::new();
        let guard = guard(&store, StrategyKind::Composite);
        register(&store, &guard, &Fingerprint::example()).await;
        let other = Identity::example2();

        // Same device, same network.
        let screening = guard.screen(&Fingerprint::example());
        let decision = guard.check(&other, None, &screening).await.unwrap();
        assert_eq!(decision, Decision::Block(Block::Signal(SignalKind::Device)));

        // Different device, same network.
        let shared_network = Fingerprint {
            network: Fingerprint::example().network,
            ..Fingerprint::example2()
        };
        let screening = guard.screen(&shared_network);
        let decision = guard.check(&other, None, &screening).await.unwrap();
        assert_eq!(decision, Decision::Block(Block::Signal(SignalKind::Network)));

        // Same device, different network.
        let roaming = Fingerprint {
            network: Some("192.168.1.1".to_string()),
            ..Fingerprint::example()
        };
        let screening = guard.screen(&roaming);
        let decision = guard.check(&other, None, &screening).await.unwrap();
        assert_eq!(
            decision,
            Decision::Block(Block::Signal(SignalKind::DeviceSignature))
        );

        // Nothing shared.
        let screening = guard.screen(&Fingerprint::example2());
        let decision = guard.check(&other, None, &screening).await.unwrap();
        assert_eq!(decision, Decision::Allow);
    }

    #[rocket::async_test]
    async fn strategy_decides_which_signals_count() {
        let store = MemoryStore::new();
        let shared_network = Fingerprint {
            network: Fingerprint::example().network,
            ..Fingerprint::example2()
        };

        let device = guard(&store, StrategyKind::Device);
        assert_eq!(device.strategy().name(), DeviceStrategy.name());
        register(&store, &device, &Fingerprint::example()).await;
        let screening = device.screen(&shared_network);
        let decision = device.check(&Identity::example2(), None, &screening).await.unwrap();
        assert_eq!(decision, Decision::Allow);

        let store = MemoryStore::new();
        let network = guard(&store, StrategyKind::Network);
        assert_eq!(network.strategy().name(), NetworkStrategy.name());
        register(&store, &network, &Fingerprint::example()).await;
        let screening = network.screen(&shared_network);
        let decision = network.check(&Identity::example2(), None, &screening).await.unwrap();
        assert_eq!(decision, Decision::Block(Block::Signal(SignalKind::Network)));
    }

    #[rocket::async_test]
    async fn completion_records_of_others_block_completion() {
        let store = MemoryStore::new();
        let guard = guard(&store, StrategyKind::Device);
        let other = Voter::example2();
        store.register_voter(&other, &[]).await.unwrap();

        let screening = guard.screen(&Fingerprint::example());
        let record = CompletionRecord {
            voter_id: other.id,
            keys: screening.keys(),
            completed_at: Utc::now(),
        };
        store
            .commit_completion(other.id, other.version, &record, &[])
            .await
            .unwrap();

        let voter = Voter::example();
        store.register_voter(&voter, &[]).await.unwrap();
        let decision = guard.check_completion(&voter, &screening).await.unwrap();
        assert_eq!(decision, Decision::Block(Block::CompletedElsewhere));

        let elsewhere = guard.screen(&Fingerprint::example2());
        let decision = guard.check_completion(&voter, &elsewhere).await.unwrap();
        assert_eq!(decision, Decision::Allow);
    }
}
