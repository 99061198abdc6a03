//! Shared helpers for the library and the `keyspace-tail` binary.

pub mod bootstrap;
