//! Debounced filter/pagination state for list views, with loop protection.

mod guard;
mod state;

pub use guard::{GuardLimits, OperationGuard};
pub use state::{
  FieldClass, FilterCommit, FilterConfig, FilterMachine, FilterState, OperationType, Pagination, Phase, SortOrder,
};
