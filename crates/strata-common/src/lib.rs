//! # strata-common
//!
//! Shared types, error definitions, configuration models, request context
//! and constants used across the entire strata workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the primitives the store, the image pipeline
//! and the CLI build upon.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod types;
