//! geoload: concurrent CityGML bulk importer
//!
//! Streams large CityGML documents into a spatial database, featuring:
//! - Chunked streaming reader for plain and bzip2 compressed documents
//! - Adaptive worker pools for feature import and xlink handling
//! - Partitioned identifier caches that spill to disk-backed tables
//! - Deferred resolution of forward references after each file
//! - Index deactivation and reactivation around the bulk load
//! - Cooperative cancellation shared by every stage of a run

pub mod cache;
pub mod concurrent;
pub mod config;
pub mod database;
pub mod import;
pub mod types;
pub mod xlink;

pub use config::Config;
pub use types::*;
