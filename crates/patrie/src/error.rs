// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the trie core.
//!
//! Transient contention (CAS failures, queue-lock contention) is never
//! surfaced as an error; the engines retry internally. Only persistent
//! conditions reach the caller: the slab hitting its cap, caller misuse,
//! and image corruption on load.

use std::fmt;
use std::io;

/// Errors surfaced by trie operations
#[derive(Debug)]
pub enum TrieError {
    /// Slab reached its reservation cap; the insert did not happen and the
    /// structure is unchanged
    OutOfMemory,

    /// Caller-supplied argument violates a construction-time contract
    /// (value size alignment/cap, write on a read-only trie, ...)
    InvalidArgument(String),

    /// Token or trie state-machine misuse by the caller
    LogicError(String),

    /// Persisted image failed validation (magic, version, checksum, geometry)
    Corruption(String),

    /// Backing-file operation failed
    Io(io::Error),
}

impl fmt::Display for TrieError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "Trie memory pool is at capacity"),
            Self::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            Self::LogicError(msg) => write!(f, "Logic error: {msg}"),
            Self::Corruption(msg) => write!(f, "Image corruption: {msg}"),
            Self::Io(e) => write!(f, "Backing file I/O failed: {e}"),
        }
    }
}

impl std::error::Error for TrieError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrieError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result type for trie operations
pub type Result<T> = std::result::Result<T, TrieError>;
