//! Cryptographic utilities for the networking core
//!
//! This module provides:
//! - SHA-256 and double SHA-256 hashing
//! - Incremental payload hashing for checksums

pub mod hash;

pub use hash::{checksum, double_sha256, double_sha256_hex, sha256, PayloadHasher};
