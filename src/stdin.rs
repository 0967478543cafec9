//! Stdin command injector

use peerchat_core::OutboundQueue;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

/// Queue every line read from `input` until it ends.
///
/// End of input stops the reader only; the node keeps running.
pub async fn forward_lines<R>(input: R, queue: OutboundQueue)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Err(e) = queue.submit(line).await {
                    warn!(error = %e, "Stopping stdin reader");
                    break;
                }
            }
            Ok(None) => {
                debug!("stdin closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Reading stdin failed");
                break;
            }
        }
    }
}
