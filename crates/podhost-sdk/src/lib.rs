//! # podhost-sdk
//!
//! Public SDK for driving podhost as a Rust library.
//!
//! Provides three main entry points:
//! - [`PodSandboxConfigBuilder`](builder::PodSandboxConfigBuilder) and
//!   [`ContainerConfigBuilder`](builder::ContainerConfigBuilder): fluent
//!   construction of sandbox and container configs, annotations included.
//! - [`wait_for_template_save`](template::wait_for_template_save): polls
//!   diagnostics until a template sandbox is ready to clone.
//! - [`EventListener`](event::EventListener): subscribes to lifecycle events.
//!
//! # Example
//!
//! ```rust,no_run
//! use podhost_sdk::builder::{ContainerConfigBuilder, PodSandboxConfigBuilder};
//!
//! let sandbox = PodSandboxConfigBuilder::new("web")
//!     .runtime_handler("hypervisor")
//!     .memory_mb(2048)
//!     .save_as_template()
//!     .build();
//! let container = ContainerConfigBuilder::new("warmup")
//!     .image("mcr.example/app:1.0")
//!     .command(vec!["/app/warm".to_string()])
//!     .save_as_template()
//!     .build();
//! ```

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod builder;
pub mod event;
pub mod template;
