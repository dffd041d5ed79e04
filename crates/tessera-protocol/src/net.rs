//! Broadcast channel abstraction and typed message plumbing
//!
//! Every protocol of a group shares one broadcast channel. Messages travel as
//! tagged envelopes carrying the sender's public key; each protocol reads the
//! channel through a [`MessageReceiver`] that keeps only its own message type.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::NetworkError;

/// Message as delivered by the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender_public_key: Vec<u8>,
    pub message_type: String,
    pub payload: Vec<u8>,
}

/// Best-effort broadcast channel shared by the members of a group
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    /// Channel name
    fn name(&self) -> &str;

    /// Public key attached to messages sent through this handle
    fn public_key(&self) -> &[u8];

    /// Allow a message type to be sent and delivered
    fn register_message_type(&self, message_type: &str);

    /// Broadcast a payload of a registered message type
    async fn send(&self, message_type: &str, payload: Vec<u8>) -> Result<(), NetworkError>;

    /// Receive every envelope broadcast from now on
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;
}

/// Flat protocol message with a stable wire tag
pub trait NetMessage:
    bitcode::Encode + for<'a> bitcode::Decode<'a> + Clone + Send + Sync + 'static
{
    const TYPE: &'static str;

    fn to_payload(&self) -> Vec<u8> {
        bitcode::encode(self)
    }

    fn from_payload(bytes: &[u8]) -> Result<Self, NetworkError> {
        Ok(bitcode::decode(bytes)?)
    }
}

/// A decoded message together with its sender's public key
#[derive(Debug, Clone)]
pub struct Received<M> {
    pub sender_public_key: Vec<u8>,
    pub message: M,
}

/// Typed view of a broadcast channel subscription
pub struct MessageReceiver<M> {
    inner: broadcast::Receiver<Envelope>,
    _message: PhantomData<fn() -> M>,
}

impl<M: NetMessage> MessageReceiver<M> {
    /// Register `M` on the channel and subscribe to it
    pub fn new(channel: &dyn BroadcastChannel) -> Self {
        channel.register_message_type(M::TYPE);
        Self {
            inner: channel.subscribe(),
            _message: PhantomData,
        }
    }

    /// Next message of type `M`, or `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<Received<M>> {
        loop {
            match self.inner.recv().await {
                Ok(envelope) if envelope.message_type == M::TYPE => {
                    match M::from_payload(&envelope.payload) {
                        Ok(message) => {
                            return Some(Received {
                                sender_public_key: envelope.sender_public_key,
                                message,
                            })
                        }
                        Err(e) => debug!("Dropping malformed {} message: {}", M::TYPE, e),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("{} receiver lagged, skipped {} messages", M::TYPE, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// How a message is re-sent after the first broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retransmission {
    /// Send once
    Once,
    /// Re-send at a fixed interval
    Fixed(Duration),
    /// Re-send with a doubling interval, capped at `max`
    Backoff { initial: Duration, max: Duration },
}

impl Retransmission {
    fn next_delay(&self, previous: Option<Duration>) -> Option<Duration> {
        match *self {
            Retransmission::Once => None,
            Retransmission::Fixed(interval) => Some(interval),
            Retransmission::Backoff { initial, max } => {
                Some(previous.map_or(initial, |delay| (delay * 2).min(max)))
            }
        }
    }
}

/// Send `message` and keep re-sending it per `strategy` until `ctx` is
/// cancelled. Only the first send's error is returned.
pub async fn broadcast<M: NetMessage>(
    ctx: &CancellationToken,
    channel: Arc<dyn BroadcastChannel>,
    message: &M,
    strategy: Retransmission,
) -> Result<(), NetworkError> {
    let payload = message.to_payload();
    channel.send(M::TYPE, payload.clone()).await?;

    if strategy == Retransmission::Once {
        return Ok(());
    }

    let ctx = ctx.clone();
    tokio::spawn(async move {
        let mut delay = None;
        while let Some(next) = strategy.next_delay(delay) {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(next) => {}
            }
            if let Err(e) = channel.send(M::TYPE, payload.clone()).await {
                debug!("Retransmission of {} failed: {}", M::TYPE, e);
            }
            delay = Some(next);
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let strategy = Retransmission::Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(300),
        };
        let first = strategy.next_delay(None).unwrap();
        let second = strategy.next_delay(Some(first)).unwrap();
        let third = strategy.next_delay(Some(second)).unwrap();
        assert_eq!(first, Duration::from_millis(100));
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(third, Duration::from_millis(300));
    }

    #[test]
    fn test_fixed_and_once() {
        let fixed = Retransmission::Fixed(Duration::from_secs(1));
        assert_eq!(
            fixed.next_delay(Some(Duration::from_secs(1))),
            Some(Duration::from_secs(1))
        );
        assert_eq!(Retransmission::Once.next_delay(None), None);
    }
}
