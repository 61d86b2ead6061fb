//! # strata-image
//!
//! Turns content-addressed image layers into layered root filesystems.
//!
//! Handles:
//! - **Fetching**: layer digest chains, image configs and blob streams.
//! - **Quota**: byte-counting readers that stop a layer at the disk limit.
//! - **Unpacking**: tar layers with whiteouts and UID/GID remapping.
//! - **Cloning**: deduplicated volume chains snapshotted into bundles.
//! - **Collection**: mark-and-collect of volumes no image depends on.
//! - **Deletion**: bundle removal and dependency deregistration.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cloner;
pub mod creator;
pub mod deleter;
pub mod fetcher;
pub mod gc;
pub mod layout;
pub mod quota;
pub mod unpack;

#[cfg(test)]
mod testing;
