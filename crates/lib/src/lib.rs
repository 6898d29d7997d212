//! rtsetup-lib: build orchestration for locally installed language runtimes.
//!
//! Turns a solved recipe into an installed runtime:
//! - `artifact`: resolves a recipe into a validated artifact build DAG
//! - `changeset`: diffs two artifact sets into added/removed/updated changes
//! - `buildlog`: consumes the remote build-progress stream
//! - `setup`: bounded-parallel artifact installation and the `install_runtime` orchestrator
//! - `store`: the on-disk runtime store and its completion marker

pub mod artifact;
pub mod buildlog;
pub mod changeset;
pub mod consts;
pub mod envdef;
pub mod fetch;
pub mod handler;
pub mod platform;
pub mod recipe;
pub mod setup;
pub mod store;

#[cfg(test)]
mod testutil;
