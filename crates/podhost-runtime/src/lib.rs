//! # podhost-runtime
//!
//! Pod sandbox and container lifecycle on one host.
//!
//! - [`Runtime`](runtime::Runtime) owns every sandbox and container and
//!   drives them through their state machines.
//! - [`backend`] provides process and hypervisor isolation behind the
//!   [`IsolationBackend`](backend::IsolationBackend) trait.
//! - [`template`] and [`state`] implement save-as-template and clone
//!   fast-start.
//! - [`diag`] is the out-of-band diagnostics channel; [`service`] is the
//!   CRI-shaped facade with deadlines and cancellation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod api;
pub mod backend;
pub mod container;
pub mod diag;
pub mod events;
pub mod exec;
pub mod logs;
pub mod options;
pub mod process;
pub mod runtime;
pub mod sandbox;
pub mod service;
pub mod state;
pub mod template;

pub use runtime::{Runtime, RuntimeBuilder};
