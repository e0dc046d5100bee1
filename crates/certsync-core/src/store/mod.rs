// # Store Implementations
//
// This module provides implementations of the KeyValueStore and
// LockService traits.

pub mod memory;

pub use memory::MemoryKeyValueStore;
