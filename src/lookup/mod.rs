//! Geolocation lookup subsystem.
//!
//! Provides address validation, the remote ip-api client with batching and
//! rate-limit handling, host record cache stores, and the resolution engine
//! that ties them together.

pub mod cache;
pub mod client;
pub mod engine;
pub mod fields;
pub mod types;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheError, CacheStore, FileCache, MemoryCache};
pub use client::{ClientConfig, IpApiClient, RemoteLookup};
pub use engine::ResolutionEngine;
pub use fields::FieldSet;
pub use types::{
    FieldValue, Fields, HostRecord, LookupError, QueryOutcome, QueryStatus, RecordSource, ResponseOptions,
    ValidationError,
};
pub use validate::validate;
