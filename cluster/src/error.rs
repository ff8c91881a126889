// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Cluster errors
//!

use crate::node::NodeAddress;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for membership and transport operations.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// No endpoint is bound at the address.
    #[error("Node {0} is unreachable.")]
    Unreachable(NodeAddress),
    /// No handler is bound for the channel at the address.
    #[error("No handler for channel '{0}' at {1}.")]
    UnknownChannel(String, NodeAddress),
    /// A payload could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),
    /// A gossip exchange failed.
    #[error("Gossip error: {0}")]
    Gossip(String),
}
