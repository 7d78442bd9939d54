//! # podhost-common
//!
//! Shared types, error definitions, configuration models, annotation keys,
//! and constants used across the podhost workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and provides the primitives that the enforcement, runtime,
//! and SDK crates build upon.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod annotations;
pub mod config;
pub mod constants;
pub mod error;
pub mod types;
