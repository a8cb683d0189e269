//! cairn-lib: content-addressed package store
//!
//! This crate provides the store coordinator used by the `cairn` binary:
//! - `address`: pure content addressing of packages and venvs
//! - `fetch`: checksum-verified, deduplicated source cache
//! - `store`: lock-protected, at-most-once publication of entries
//! - `execute`: dependency scheduling over a package graph
//! - `build`: build roots, sandboxes and deterministic artifacts
//! - `venv`: unpacked run-time closures for interactive use
//! - `cleanup`: best-effort eviction of unused entries

pub mod address;
pub mod build;
pub mod cleanup;
pub mod config;
pub mod consts;
pub mod error;
pub mod execute;
pub mod fetch;
pub mod lock;
pub mod package;
pub mod platform;
pub mod store;
pub mod util;
pub mod venv;
