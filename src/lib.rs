//! Transparent `gs://` localization for pipeline units of work.
//!
//! Declared inputs that point at Cloud Storage are downloaded into a local
//! cache before a unit runs, and declared remote outputs are uploaded once
//! it succeeds. See [`services::hooks::GsHooks`] for the entry point.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;

pub use errors::{LocalizeError, LocalizeResult};
pub use models::{
    binding::{InputBinding, InputValue, OutputBinding, OutputValue},
    remote_ref::RemoteRef,
    stat::{ObjectEntry, ObjectStat},
};
pub use services::{
    accessor::{ObjectAccessor, StoreAccessor, StoreBackend},
    cache::LocalizationCache,
    hooks::{GsHooks, UnitHooks},
    proxy::PathProxy,
    runner::{UnitSpec, run_unit},
};
