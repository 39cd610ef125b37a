//! Chain store, consensus rules and orphan handling (spec.md §4.2–§4.3).

pub mod orphans;
pub mod rules;
pub mod store;

pub use store::{AcceptOutcome, ChainStore, RejectReason};
