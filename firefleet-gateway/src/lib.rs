//! HTTP API gateway for the firefleet microVM provisioning engine.
//!
//! Maps the engine's create, delete, list and stats operations onto JSON
//! endpoints and engine errors onto HTTP status codes.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod routes;
