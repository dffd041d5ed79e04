//! Block height source and block-bound cancellation

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ProtocolError, Result};

/// Source of the chain's block height
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Current block height
    async fn current_block(&self) -> Result<u64>;

    /// Resolve once the chain has reached `height`
    async fn wait_for_block(&self, height: u64) -> Result<()>;
}

/// Wait for `height` unless `ctx` is cancelled first
pub async fn wait_for_block(
    ctx: &CancellationToken,
    blocks: &dyn BlockSource,
    height: u64,
) -> Result<()> {
    tokio::select! {
        _ = ctx.cancelled() => Err(ProtocolError::Cancelled),
        result = blocks.wait_for_block(height) => result,
    }
}

/// Child of `parent` cancelled once the chain reaches `height`.
///
/// The helper task exits as soon as the child is cancelled by anyone, so
/// abandoned windows do not leak waiters.
pub fn cancel_at_block(
    parent: &CancellationToken,
    blocks: Arc<dyn BlockSource>,
    height: u64,
) -> CancellationToken {
    let child = parent.child_token();
    let token = child.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            result = blocks.wait_for_block(height) => {
                if let Err(e) = result {
                    debug!(block = height, "Block wait failed, closing window: {}", e);
                }
                token.cancel();
            }
        }
    });
    child
}
