//! Client-side cache coherence for a manufacturing operations dashboard.
//!
//! Remote records (factories, lines, teams, handbags and their children) are
//! read through a tag-keyed cache with deduplicated fetches. Writes apply
//! optimistically, roll back on failure and cascade invalidation along the
//! entity relationship graph.

pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod filter;
pub mod logging;
pub mod models;
pub mod query;
pub mod remote;
pub mod replay;

pub use cache::{CacheResult, CacheSource, ListParams, Mutation, QueryClient, Tag, TagPattern};
pub use error::{CacheError, RemoteError, ValidationError};
