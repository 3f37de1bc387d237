//! Workspace facade.
//!
//! The argument-transit protocol lives in the `crates/cmdproxy-*` members;
//! this crate carries no code of its own and exists only so the workspace
//! root has a package to attach `tests/e2e.rs` to.

#![deny(unsafe_code)]
