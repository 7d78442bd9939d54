//! # podhost-core
//!
//! Host-side primitives shared by every sandbox on a host:
//! - **Cgroups v2**: CPU, memory, and storage limits written to and read
//!   back from the unified hierarchy.
//! - **Enforcer**: the [`ResourceEnforcer`](enforcer::ResourceEnforcer)
//!   capability, scoped per sandbox and per container.
//! - **Devices**: the [`DeviceAssigner`](device::DeviceAssigner) capability
//!   with per-host exclusivity and per-container visibility.
//! - **Mounts**: file-share validation and policy checks.
//!
//! Every call is keyed by a [`Scope`](scope::Scope) so limits and devices
//! never leak across sandbox boundaries.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod device;
pub mod enforcer;
pub mod mount;
pub mod scope;
