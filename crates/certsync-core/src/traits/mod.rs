//! Core traits for certsync
//!
//! This module defines the abstract interfaces certsync consumes from its
//! environment.
//!
//! - [`KeyValueStore`]: Flat, prefix-scoped byte store
//! - [`LockService`]: Lease-based distributed mutual exclusion

pub mod kv_store;
pub mod lock_service;

pub use kv_store::KeyValueStore;
pub use lock_service::LockService;
