//! Value types shared by the accessor, the cache, and the hooks.
//!
//! `RemoteRef` is re-derived from the declared path at every hook call and
//! never persisted; cache entries are implicit in the cache root's layout.

pub mod binding;
pub mod remote_ref;
pub mod stat;
