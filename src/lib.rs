//! iptracker: IP geolocation with a local cache in front of a rate-limited
//! remote lookup service.

pub mod config;
pub mod lookup;
pub mod metrics;
pub mod server;
