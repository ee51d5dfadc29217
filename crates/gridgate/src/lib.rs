//! gridgate is the remote-job management engine of a batch scheduler.
//!
//! It tracks jobs that have been handed to external, slow and often
//! unreliable remote execution services and drives each of them through a
//! submit/monitor/complete lifecycle. The engine itself is protocol
//! agnostic: the actual remote calls happen behind the [`helper::RemoteHelper`]
//! seam, durable job records live behind [`events::UpdateSink`], and
//! credential files are read through [`credential::CredentialSource`].
//!
//! Everything runs on a single cooperative task; see [`engine`].

pub mod common;
pub mod config;
pub mod credential;
pub mod descriptor;
pub mod engine;
pub mod events;
pub mod helper;
pub mod job;
pub mod resource;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = common::error::GridError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V, fxhash::FxBuildHasher>;
pub type Set<T> = hashbrown::HashSet<T, fxhash::FxBuildHasher>;

pub use common::ids::{CredentialId, JobId, ResourceId, TimerId, WatchToken};
