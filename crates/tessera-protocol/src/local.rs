//! In-process broadcast network and block counter
//!
//! Used by the devnet runner and by tests to run many members inside one
//! process.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chain::BlockSource;
use crate::error::{NetworkError, ProtocolError, Result};
use crate::net::{BroadcastChannel, Envelope};

const HUB_CAPACITY: usize = 4096;

/// Shared hub every local channel publishes into
#[derive(Debug, Clone)]
pub struct LocalNetwork {
    name: String,
    hub: broadcast::Sender<Envelope>,
}

impl LocalNetwork {
    pub fn new(name: impl Into<String>) -> Self {
        let (hub, _) = broadcast::channel(HUB_CAPACITY);
        Self {
            name: name.into(),
            hub,
        }
    }

    /// Channel handle of the operator owning `public_key`
    pub fn channel(&self, public_key: Vec<u8>) -> Arc<LocalChannel> {
        Arc::new(LocalChannel {
            name: self.name.clone(),
            public_key,
            hub: self.hub.clone(),
            registered: RwLock::new(HashSet::new()),
        })
    }
}

/// One operator's handle on a [`LocalNetwork`]
#[derive(Debug)]
pub struct LocalChannel {
    name: String,
    public_key: Vec<u8>,
    hub: broadcast::Sender<Envelope>,
    registered: RwLock<HashSet<String>>,
}

impl LocalChannel {
    fn is_registered(&self, message_type: &str) -> bool {
        self.registered
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(message_type)
    }
}

#[async_trait]
impl BroadcastChannel for LocalChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn register_message_type(&self, message_type: &str) {
        self.registered
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(message_type.to_string());
    }

    async fn send(&self, message_type: &str, payload: Vec<u8>) -> std::result::Result<(), NetworkError> {
        if !self.is_registered(message_type) {
            return Err(NetworkError::UnregisteredType(message_type.to_string()));
        }
        let envelope = Envelope {
            sender_public_key: self.public_key.clone(),
            message_type: message_type.to_string(),
            payload,
        };
        // No subscribers is not an error on a best-effort broadcast
        if self.hub.send(envelope).is_err() {
            debug!(channel = %self.name, "No subscribers for {}", message_type);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.hub.subscribe()
    }
}

/// Block height counter advanced by hand or by a ticker task
#[derive(Debug)]
pub struct LocalBlockCounter {
    height: watch::Sender<u64>,
}

impl LocalBlockCounter {
    pub fn new(initial_height: u64) -> Arc<Self> {
        let (height, _) = watch::channel(initial_height);
        Arc::new(Self { height })
    }

    /// Advance by one block and return the new height
    pub fn tick(&self) -> u64 {
        let mut new_height = 0;
        self.height.send_modify(|height| {
            *height += 1;
            new_height = *height;
        });
        new_height
    }

    /// Jump to `height`, never moving backwards
    pub fn advance_to(&self, height: u64) {
        self.height.send_if_modified(|current| {
            if height > *current {
                *current = height;
                true
            } else {
                false
            }
        });
    }

    pub fn height(&self) -> u64 {
        *self.height.borrow()
    }

    /// Produce one block every `block_time` until `ctx` is cancelled
    pub fn spawn_ticker(self: &Arc<Self>, block_time: Duration, ctx: CancellationToken) -> JoinHandle<()> {
        let counter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(block_time);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = interval.tick() => {
                        counter.tick();
                    }
                }
            }
        })
    }
}

#[async_trait]
impl BlockSource for LocalBlockCounter {
    async fn current_block(&self) -> Result<u64> {
        Ok(self.height())
    }

    async fn wait_for_block(&self, height: u64) -> Result<()> {
        let mut receiver = self.height.subscribe();
        receiver
            .wait_for(|current| *current >= height)
            .await
            .map(|_| ())
            .map_err(|e| ProtocolError::Block(e.to_string()))
    }
}
