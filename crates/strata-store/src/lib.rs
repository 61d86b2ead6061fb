//! # strata-store
//!
//! The on-disk side of strata.
//!
//! Handles:
//! - **Volumes**: copy-on-write layer volumes keyed by (namespaced) chain ID.
//! - **Bundles**: per-image directories holding `image.json` and the rootfs.
//! - **Dependencies**: which images still need which volumes.
//! - **Locks**: serializing garbage collection against in-flight clones.
//! - **Stats**: disk usage of volumes and bundles.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bundle;
pub mod dependency;
pub mod fsutil;
pub mod lock;
pub mod stats;
pub mod volume;
