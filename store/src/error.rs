// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Store errors
//!

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for store operations.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The store could not be created.
    #[error("Can't create store: {0}")]
    CreateStore(String),
    /// A get operation failed.
    #[error("Get error: {0}")]
    Get(String),
    /// The requested entry does not exist.
    #[error("Entry not found.")]
    EntryNotFound,
    /// Generic storage failure.
    #[error("Store error: {0}")]
    Store(String),
}
