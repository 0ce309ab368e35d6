//! Cryptographic utilities for the p2p layer
//!
//! This module provides:
//! - SHA-256 / SHA3-256 / RIPEMD-160 hashing
//! - Ed25519 node identity keys

pub mod hash;
pub mod keys;

pub use hash::{double_sha256, ripemd160, sha256, sha256_concat, sha3_256};
pub use keys::{KeyError, NodeKey, PubKey, SIGNATURE_LEN};
