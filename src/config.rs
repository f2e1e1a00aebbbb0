use std::sync::Arc;

use chrono::Duration;
use log::{error, info, warn};
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;

use crate::model::{
    fingerprint::StrategyKind,
    mongodb::ensure_indexes_exist,
    roster::PositionSpec,
    store::{DynStore, MemoryStore, MongoStore},
};

/// Which store backs the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    MongoDb,
    /// Everything is lost on shutdown.
    Memory,
}

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Deserialize)]
pub struct Config {
    // non-secrets
    #[serde(default = "default_session_ttl")]
    session_ttl: u32,
    institution_domain: String,
    enrollment_years: Vec<String>,
    departments: Vec<String>,
    #[serde(default)]
    detection_strategy: StrategyKind,
    #[serde(default)]
    vote_rate_limit: u32,
    #[serde(default = "default_vote_rate_window")]
    vote_rate_window: u32,
    #[serde(default = "default_transaction_retries")]
    transaction_retries: usize,
    #[serde(default)]
    store: StoreKind,
    #[serde(default)]
    roster: Option<Vec<PositionSpec>>,
    // secrets
    hmac_secret: String,
}

fn default_session_ttl() -> u32 {
    2 * 60 * 60
}

fn default_vote_rate_window() -> u32 {
    10 * 60
}

fn default_transaction_retries() -> usize {
    3
}

impl Config {
    /// Valid lifetime of a voter session in seconds.
    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(self.session_ttl.into())
    }

    /// Domain of institutional email addresses.
    pub fn institution_domain(&self) -> &str {
        &self.institution_domain
    }

    /// Two-digit admission years eligible to vote.
    pub fn enrollment_years(&self) -> &[String] {
        &self.enrollment_years
    }

    /// Department codes as they appear in institutional emails.
    pub fn departments(&self) -> &[String] {
        &self.departments
    }

    pub fn detection_strategy(&self) -> StrategyKind {
        self.detection_strategy
    }

    /// Most votes accepted from one network per window; zero disables the limit.
    pub fn vote_rate_limit(&self) -> u32 {
        self.vote_rate_limit
    }

    /// Window of the per-network vote rate limit in seconds.
    pub fn vote_rate_window(&self) -> Duration {
        Duration::seconds(self.vote_rate_window.into())
    }

    /// How many times a conflicting transaction is retried.
    pub fn transaction_retries(&self) -> usize {
        self.transaction_retries
    }

    pub fn store(&self) -> StoreKind {
        self.store
    }

    /// Positions and candidates given in the configuration, if any.
    /// Otherwise the roster is read from the `candidates` collection.
    pub fn roster(&self) -> Option<&[PositionSpec]> {
        self.roster.as_deref()
    }

    /// Secret key used to sign HMACs.
    pub fn hmac_secret(&self) -> &[u8] {
        self.hmac_secret.as_bytes()
    }
}

/// A fairing that loads the application config and puts it in managed state.
/// This could easily be achieved using `AdHoc::config`, but is written out
/// explicitly for symmetry with the other fairings and control over error
/// messages.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    // non-secrets
    #[serde(default = "default_db_name")]
    db_name: String,
    // secrets
    db_uri: String,
}

fn default_db_name() -> String {
    "campus_ballot".to_string()
}

/// A fairing that sets up the configured store and places it into managed
/// state as a `DynStore`. For MongoDB this loads the database config,
/// connects, and ensures the indexes exist. Must be attached after
/// `ConfigFairing`.
pub struct DatabaseFairing;

#[rocket::async_trait]
impl Fairing for DatabaseFairing {
    fn info(&self) -> Info {
        Info {
            name: "Store",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let Some(kind) = rocket.state::<Config>().map(Config::store) else {
            error!("Application config must be loaded before the store");
            return Err(rocket);
        };
        let store: DynStore = match kind {
            StoreKind::Memory => {
                warn!("Using the in-memory store; nothing will be persisted");
                Arc::new(MemoryStore::new())
            }
            StoreKind::MongoDb => {
                let connected = connect(&rocket).await;
                match connected {
                    Some(store) => Arc::new(store),
                    None => return Err(rocket),
                }
            }
        };

        // Manage the state.
        Ok(rocket.manage(store))
    }
}

async fn connect(rocket: &Rocket<Build>) -> Option<MongoStore> {
    // Load the config.
    let config = match rocket.figment().extract::<DbConfig>() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load database config");
            rocket::config::pretty_print_error(e);
            return None;
        }
    };
    info!("Loaded database config, connecting...");
    // Construct the connection.
    let client = match MongoClient::with_uri_str(config.db_uri).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to connect to database: {e}");
            return None;
        }
    };
    let db = client.database(&config.db_name);

    // Ensure the required indexes exist.
    if let Err(e) = ensure_indexes_exist(&db).await {
        error!("Failed to connect to database: {e}");
        return None;
    }
    info!("...database connection online!");

    Some(MongoStore::new(client, &db))
}

/// Example data for tests.
#[cfg(test)]
mod examples {
    use super::*;

    impl Config {
        pub fn example() -> Self {
            Self {
                session_ttl: default_session_ttl(),
                institution_domain: "inst.edu".to_string(),
                enrollment_years: ["20", "21", "22", "23"].map(String::from).to_vec(),
                departments: ["03sen", "03csc", "05law"].map(String::from).to_vec(),
                detection_strategy: StrategyKind::Composite,
                vote_rate_limit: 0,
                vote_rate_window: default_vote_rate_window(),
                transaction_retries: default_transaction_retries(),
                store: StoreKind::Memory,
                roster: Some(PositionSpec::examples()),
                hmac_secret: "test secret".to_string(),
            }
        }

        /// The example config with a per-network vote limit.
        pub fn example_rate_limited(max_votes: u32) -> Self {
            Self {
                vote_rate_limit: max_votes,
                ..Self::example()
            }
        }
    }
}
