use data_encoding::HEXLOWER;
use hmac::{Hmac, Mac};
use mongodb::bson::{to_bson, Bson};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::Error;

pub type HmacSha256 = Hmac<Sha256>;

/// Device and network signals observed by the transport for one request.
/// The core never inspects where these came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint {
    pub device_id: Option<String>,
    pub browser_signature: Option<String>,
    pub network: Option<String>,
}

/// The kinds of signal a strategy can derive. Declaration order is the
/// order in which the duplicate guard checks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Device and network together: the exact same client.
    Device,
    /// The network address alone.
    Network,
    /// The device alone, whichever network it appears from.
    DeviceSignature,
}

impl SignalKind {
    /// The error reported when a signal of this kind belongs to another voter.
    pub fn block_error(self) -> Error {
        match self {
            Self::Device => {
                Error::DuplicateDevice("this device has already been used by another voter".into())
            }
            Self::Network => Error::DuplicateNetwork(
                "this network has already been used by another voter".into(),
            ),
            Self::DeviceSignature => Error::DuplicateDevice(
                "this device has already been used by another voter from a different network"
                    .into(),
            ),
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Network => "network",
            Self::DeviceSignature => "device_signature",
        }
    }
}

impl From<SignalKind> for Bson {
    fn from(kind: SignalKind) -> Self {
        to_bson(&kind).expect("Serialisation is infallible")
    }
}

/// A raw signal derived from a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub kind: SignalKind,
    pub value: String,
}

impl Signal {
    pub fn new(kind: SignalKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// A signal after keying, safe to persist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyedSignal {
    pub kind: SignalKind,
    pub key: String,
}

/// Turns raw signals into HMAC keys so device identifiers and addresses
/// are never stored in the clear.
#[derive(Clone)]
pub struct SignalKeyer {
    secret: Vec<u8>,
}

impl SignalKeyer {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn key(&self, signal: &Signal) -> KeyedSignal {
        let mut hmac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        hmac.update(signal.kind.tag().as_bytes());
        hmac.update(b":");
        hmac.update(signal.value.as_bytes());
        KeyedSignal {
            kind: signal.kind,
            key: HEXLOWER.encode(&hmac.finalize().into_bytes()),
        }
    }
}

/// A policy for which fingerprint signals identify a voter.
pub trait DetectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Derive the signals this strategy cares about. Missing inputs simply
    /// produce fewer signals.
    fn signals(&self, fingerprint: &Fingerprint) -> Vec<Signal>;

    /// Whether votes should be rate limited per network.
    fn limits_network_rate(&self) -> bool {
        false
    }
}

/// The device part of a fingerprint: device id and browser signature, whichever are present.
pub fn device_signature(fingerprint: &Fingerprint) -> Option<String> {
    match (&fingerprint.device_id, &fingerprint.browser_signature) {
        (Some(id), Some(sig)) => Some(format!("{id}|{sig}")),
        (Some(id), None) => Some(id.clone()),
        (None, Some(sig)) => Some(sig.clone()),
        (None, None) => None,
    }
}

/// Device, network, and cross-network device checks together.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompositeStrategy;

impl DetectionStrategy for CompositeStrategy {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn signals(&self, fingerprint: &Fingerprint) -> Vec<Signal> {
        let device = device_signature(fingerprint);
        let mut signals = Vec::new();
        if let (Some(device), Some(network)) = (&device, &fingerprint.network) {
            signals.push(Signal::new(SignalKind::Device, format!("{device}@{network}")));
        }
        if let Some(network) = &fingerprint.network {
            signals.push(Signal::new(SignalKind::Network, network.clone()));
        }
        if let Some(device) = device {
            signals.push(Signal::new(SignalKind::DeviceSignature, device));
        }
        signals
    }

    fn limits_network_rate(&self) -> bool {
        true
    }
}

/// Only the device identifies a voter; shared networks are fine.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceStrategy;

impl DetectionStrategy for DeviceStrategy {
    fn name(&self) -> &'static str {
        "device"
    }

    fn signals(&self, fingerprint: &Fingerprint) -> Vec<Signal> {
        device_signature(fingerprint)
            .map(|device| Signal::new(SignalKind::DeviceSignature, device))
            .into_iter()
            .collect()
    }
}

/// Only the network address identifies a voter.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkStrategy;

impl DetectionStrategy for NetworkStrategy {
    fn name(&self) -> &'static str {
        "network"
    }

    fn signals(&self, fingerprint: &Fingerprint) -> Vec<Signal> {
        fingerprint
            .network
            .as_ref()
            .map(|network| Signal::new(SignalKind::Network, network.clone()))
            .into_iter()
            .collect()
    }

    fn limits_network_rate(&self) -> bool {
        true
    }
}

/// Strategy selection, as written in the configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Composite,
    Device,
    Network,
}

impl StrategyKind {
    pub fn strategy(self) -> Box<dyn DetectionStrategy> {
        match self {
            Self::Composite => Box::new(CompositeStrategy),
            Self::Device => Box::new(DeviceStrategy),
            Self::Network => Box::new(NetworkStrategy),
        }
    }
}

/// Example data for tests.
#[cfg(test)]
pub(crate) mod examples {
    use super::*;

    impl Fingerprint {
        pub fn example() -> Self {
            Self {
                device_id: Some("device-a".to_string()),
                browser_signature: Some("firefox-linux".to_string()),
                network: Some("10.0.0.1".to_string()),
            }
        }

        pub fn example2() -> Self {
            Self {
                device_id: Some("device-b".to_string()),
                browser_signature: Some("chrome-android".to_string()),
                network: Some("10.0.0.2".to_string()),
            }
        }
    }
}
