// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Node-to-node transport
//!
//! Reliable point-to-point request/response between node addresses. Frames
//! are tagged with a channel name so one endpoint can serve several
//! protocols (gossip, entity routing, coordination). The transport contract
//! assumes at-least-once delivery with no ordering across connections;
//! protocols built on top stay idempotent and tag their data (incarnations,
//! versions) accordingly.
//!
//! The in-process [`LoopbackTransport`] implementation backs tests and
//! single-process clusters; network backends are external collaborators
//! implementing the same [`Transport`] trait.
//!

use crate::{error::Error, node::NodeAddress};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use std::{collections::HashMap, sync::Arc};

/// A channel-tagged request payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub channel: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(channel: impl Into<String>, payload: Vec<u8>) -> Self {
        Frame {
            channel: channel.into(),
            payload,
        }
    }
}

/// Server side of a channel: turns a request payload into a response
/// payload.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn on_frame(&self, payload: Vec<u8>) -> Result<Vec<u8>, Error>;
}

/// Node-to-node messaging: sending frames to peers and serving channels of
/// the local endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a frame to a node and awaits the response payload.
    async fn request(
        &self,
        to: &NodeAddress,
        frame: Frame,
    ) -> Result<Vec<u8>, Error>;

    /// Binds a handler for one channel of the given local address.
    async fn bind(
        &self,
        address: NodeAddress,
        channel: &str,
        handler: Arc<dyn FrameHandler>,
    );
}

type ChannelHandlers = HashMap<String, Arc<dyn FrameHandler>>;

/// In-process transport. Every node of a test cluster binds its channel
/// handlers on the same `LoopbackTransport`; unbinding an address simulates
/// a node crash.
#[derive(Default, Clone)]
pub struct LoopbackTransport {
    endpoints: Arc<RwLock<HashMap<NodeAddress, ChannelHandlers>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every handler of the address. Requests to it will fail with
    /// `Error::Unreachable` from then on.
    pub async fn unbind(&self, address: &NodeAddress) {
        let mut endpoints = self.endpoints.write().await;
        endpoints.remove(address);
        debug!("Unbound endpoint {}.", address);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn request(
        &self,
        to: &NodeAddress,
        frame: Frame,
    ) -> Result<Vec<u8>, Error> {
        let handler = {
            let endpoints = self.endpoints.read().await;
            let channels = endpoints
                .get(to)
                .ok_or_else(|| Error::Unreachable(to.clone()))?;
            channels
                .get(&frame.channel)
                .cloned()
                .ok_or_else(|| {
                    Error::UnknownChannel(frame.channel.clone(), to.clone())
                })?
        };
        handler.on_frame(frame.payload).await
    }

    async fn bind(
        &self,
        address: NodeAddress,
        channel: &str,
        handler: Arc<dyn FrameHandler>,
    ) {
        let mut endpoints = self.endpoints.write().await;
        endpoints
            .entry(address)
            .or_default()
            .insert(channel.to_owned(), handler);
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    struct Echo;

    #[async_trait]
    impl FrameHandler for Echo {
        async fn on_frame(&self, payload: Vec<u8>) -> Result<Vec<u8>, Error> {
            Ok(payload)
        }
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let transport = LoopbackTransport::new();
        let address = NodeAddress::new("127.0.0.1", 2551);
        transport
            .bind(address.clone(), "echo", Arc::new(Echo))
            .await;

        let reply = transport
            .request(&address, Frame::new("echo", b"ping".to_vec()))
            .await
            .unwrap();
        assert_eq!(reply, b"ping".to_vec());
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let transport = LoopbackTransport::new();
        let address = NodeAddress::new("127.0.0.1", 2551);
        transport
            .bind(address.clone(), "echo", Arc::new(Echo))
            .await;

        let result = transport
            .request(&address, Frame::new("other", Vec::new()))
            .await;
        assert!(matches!(result, Err(Error::UnknownChannel(_, _))));
    }

    #[tokio::test]
    async fn test_unbound_address_is_unreachable() {
        let transport = LoopbackTransport::new();
        let address = NodeAddress::new("127.0.0.1", 2551);
        transport
            .bind(address.clone(), "echo", Arc::new(Echo))
            .await;
        transport.unbind(&address).await;

        let result = transport
            .request(&address, Frame::new("echo", Vec::new()))
            .await;
        assert!(matches!(result, Err(Error::Unreachable(_))));
    }
}
