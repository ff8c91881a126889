// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Database abstraction
//!
//! Object-safe traits implemented by storage backends. A [`Collection`] is
//! an ordered key/value space; a [`DbManager`] creates named, prefixed
//! collections. The in-memory backend lives in [`crate::memory`]; other
//! backends are external to this workspace.
//!

use crate::error::Error;

/// An ordered key/value collection. Keys iterate in lexicographic order,
/// which callers exploit by zero-padding numeric keys.
pub trait Collection: Send + Sync {
    /// The collection name.
    fn name(&self) -> &str;

    /// Gets the value associated with the key.
    fn get(&self, key: &str) -> Result<Vec<u8>, Error>;

    /// Puts a value for the key, replacing any previous value.
    fn put(&mut self, key: &str, data: &[u8]) -> Result<(), Error>;

    /// Deletes the entry for the key, if present.
    fn del(&mut self, key: &str) -> Result<(), Error>;

    /// Returns the last entry in key order, if any.
    fn last(&self) -> Option<(String, Vec<u8>)>;

    /// Returns the entries with keys strictly greater than `key`, in order.
    fn after(&self, key: &str) -> Vec<(String, Vec<u8>)>;

    /// Removes every entry from the collection.
    fn purge(&mut self) -> Result<(), Error>;
}

/// Factory for collections. Shared across actors as `Arc<dyn DbManager>`
/// through a system helper, so persistent actors stay agnostic of the
/// concrete storage technology.
pub trait DbManager: Send + Sync + 'static {
    /// Creates (or opens) the collection `name` under the given prefix.
    fn create_collection(
        &self,
        name: &str,
        prefix: &str,
    ) -> Result<Box<dyn Collection>, Error>;
}
