//! Relay between an MQTT-connected sensor/actuator board and a web dashboard.
//!
//! Inbound broker traffic is persisted and fanned out to live dashboard
//! sessions by the [`bridge`]; dashboard commands go back out through the
//! [`gateway`]; history is served by [`query`] over a [`store::Store`].

pub mod bridge;
pub mod config;
pub mod db;
pub mod devices;
pub mod errors;
pub mod gateway;
pub mod live;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod query;
pub mod rest;
pub mod shutdown;
pub mod store;
pub mod validate;

pub use errors::{Error, Result};
