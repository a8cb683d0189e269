//! Shared utilities.
//!
//! Common utilities used across the crate including hashing, filesystem
//! helpers and test helpers.

pub mod fs;
pub mod hash;

#[cfg(test)]
pub mod testutil;
