#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use rocket::{Build, Rocket};

use crate::{
    config::{ConfigFairing, DatabaseFairing},
    logging::LoggerFairing,
    service::{VotingFairing, VotingService},
};

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod service;

/// Build the server from `Rocket.toml` and the environment. The config,
/// store, and voting service are set up when the rocket is ignited.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(DatabaseFairing)
        .attach(VotingFairing)
        .mount("/", api::routes())
}

/// Serve an already assembled voting service.
pub fn rocket_for_service(service: VotingService) -> Rocket<Build> {
    rocket::build()
        .attach(LoggerFairing)
        .manage(service)
        .mount("/", api::routes())
}
