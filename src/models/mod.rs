//! Dashboard entities and their create/update payloads.

mod kind;
mod types;

pub use kind::EntityKind;
pub use types::*;
