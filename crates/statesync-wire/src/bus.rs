//! Message bus abstraction.
//!
//! The bus handles message delivery between peers. Implementations may
//! use WebSockets, a broker, or any other transport; the protocol only
//! assumes ordered delivery between a given pair of addresses.

use async_trait::async_trait;

use statesync_core::Address;

use crate::error::{Result, WireError};
use crate::messages::StreamMessage;

/// Bus trait for posting and receiving stream messages.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Post a message to a specific peer.
    async fn post(&self, target: &Address, message: StreamMessage) -> Result<()>;

    /// Receive the next message from any peer.
    ///
    /// Returns the sender's address and the message. Blocks until a
    /// message is available or the bus shuts down.
    async fn recv(&self) -> Result<(Address, StreamMessage)>;

    /// Receive with timeout.
    ///
    /// Returns None if the timeout expires before a message arrives.
    async fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Option<(Address, StreamMessage)>>;

    /// This endpoint's own address.
    fn local_address(&self) -> Address;
}

/// A simple in-memory bus for testing.
///
/// Messages travel as encoded CBOR frames between endpoints, so the
/// codec path is exercised on every delivery.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::{mpsc, RwLock};

    use crate::codec;

    /// Frame for internal routing.
    #[derive(Debug, Clone)]
    struct Frame {
        from: Address,
        bytes: Vec<u8>,
    }

    /// Shared state for a memory bus network.
    pub struct MemoryHub {
        senders: RwLock<HashMap<Address, mpsc::Sender<Frame>>>,
    }

    impl MemoryHub {
        /// Create a new hub.
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                senders: RwLock::new(HashMap::new()),
            })
        }

        /// Create an endpoint attached to this hub.
        pub async fn endpoint(self: &Arc<Self>, address: Address) -> MemoryBus {
            let (tx, rx) = mpsc::channel(1000);
            self.senders.write().await.insert(address.clone(), tx);
            MemoryBus {
                address,
                hub: Arc::clone(self),
                receiver: RwLock::new(rx),
            }
        }
    }

    impl Default for MemoryHub {
        fn default() -> Self {
            Self {
                senders: RwLock::new(HashMap::new()),
            }
        }
    }

    /// In-memory bus endpoint.
    pub struct MemoryBus {
        address: Address,
        hub: Arc<MemoryHub>,
        receiver: RwLock<mpsc::Receiver<Frame>>,
    }

    #[async_trait]
    impl MessageBus for MemoryBus {
        async fn post(&self, target: &Address, message: StreamMessage) -> Result<()> {
            message.validate_limits().map_err(|reason| {
                WireError::InvalidMessage(reason.to_string())
            })?;
            let bytes = codec::encode(&message)?;

            let senders = self.hub.senders.read().await;
            let sender = senders
                .get(target)
                .ok_or_else(|| WireError::BusError(format!("unknown peer {target}")))?;
            sender
                .send(Frame {
                    from: self.address.clone(),
                    bytes,
                })
                .await
                .map_err(|_| WireError::BusError("peer disconnected".into()))
        }

        async fn recv(&self) -> Result<(Address, StreamMessage)> {
            let mut rx = self.receiver.write().await;
            match rx.recv().await {
                Some(frame) => Ok((frame.from, codec::decode(&frame.bytes)?)),
                None => Err(WireError::BusError("channel closed".into())),
            }
        }

        async fn recv_timeout(
            &self,
            timeout: std::time::Duration,
        ) -> Result<Option<(Address, StreamMessage)>> {
            let mut rx = self.receiver.write().await;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(frame)) => Ok(Some((frame.from, codec::decode(&frame.bytes)?))),
                Ok(None) => Err(WireError::BusError("channel closed".into())),
                Err(_) => Ok(None), // Timeout
            }
        }

        fn local_address(&self) -> Address {
            self.address.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryHub;
    use super::*;
    use statesync_core::StreamId;

    #[tokio::test]
    async fn test_memory_bus_post_recv() {
        let hub = MemoryHub::new();
        let a = hub.endpoint(Address::new("a")).await;
        let b = hub.endpoint(Address::new("b")).await;

        let msg = StreamMessage::UnsubscribeRequest {
            stream_id: StreamId::new("s1"),
        };
        a.post(&Address::new("b"), msg).await.unwrap();

        let (from, received) = b.recv().await.unwrap();
        assert_eq!(from, Address::new("a"));
        assert!(matches!(
            received,
            StreamMessage::UnsubscribeRequest { stream_id } if stream_id == StreamId::new("s1")
        ));
    }

    #[tokio::test]
    async fn test_memory_bus_unknown_peer() {
        let hub = MemoryHub::new();
        let a = hub.endpoint(Address::new("a")).await;

        let msg = StreamMessage::UnsubscribeRequest {
            stream_id: StreamId::new("s1"),
        };
        let err = a.post(&Address::new("nobody"), msg).await.unwrap_err();
        assert!(matches!(err, WireError::BusError(_)));
    }

    #[tokio::test]
    async fn test_memory_bus_recv_timeout() {
        let hub = MemoryHub::new();
        let a = hub.endpoint(Address::new("a")).await;

        let result = a
            .recv_timeout(std::time::Duration::from_millis(10))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
