//! Integration test suite for tasknet.
//!
//! These tests drive complete `TaskNet` instances through the public API,
//! including multi-peer delegation over the in-process network.
//!
//! # Test Categories
//!
//! - `scenarios`: End-to-end lifecycle of submitted graphs
//! - `coordination`: Delegation, fallback, clock merging and placement
//! - `heap_properties`: Randomized Fibonacci heap checks
//!
//! # CI Compatibility
//!
//! Executors are in-process fakes and peers talk over `LocalNetwork`, so
//! nothing touches the network.

mod fixtures;

mod coordination;
mod heap_properties;
mod scenarios;
