//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod doubles;
pub mod socket_guard;
