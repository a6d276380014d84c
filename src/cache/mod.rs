//! Client-side cache coherence for remote entities.
//!
//! This module keeps one process's view of remote records consistent:
//! - Deduplicated, retried fetches keyed by `Tag`
//! - Optimistic mutations with snapshot rollback
//! - Cascading invalidation driven by the relationship graph
//! - Stale-but-available reads when the network fails

pub mod cascade;
mod client;
mod clock;
mod graph;
mod mutation;
pub mod patch;
mod result;
mod retry;
mod store;
mod tag;

pub use client::{fetcher, ClientBuilder, FetchFuture, Fetcher, QueryClient, QueryOptions, Subscription};
pub use clock::{Clock, ManualClock, TokioClock};
pub use graph::{Relationship, RelationshipGraph, RELATIONSHIPS};
pub use mutation::{Mutation, MutationKind, MutationOptions, MutationOutcome, MutationStatus, PendingMutation};
pub use patch::Patch;
pub use result::{CacheResult, CacheSource};
pub use retry::RetryPolicy;
pub use store::{CacheEntry, CacheStore, InvalidateMode};
pub use tag::{ListParams, Segment, Tag, TagPattern, PAGINATION_KEYS};

pub(crate) use client::{detail_fetcher, list_fetcher};
pub(crate) use retry::millis;
