//! Post-freeze notification channel.
//!
//! When a freeze action completes, a notice is pushed onto an unbounded
//! channel. Downstream agents (catalog publication, replication) consume
//! the receiver; their internals live outside this crate.

use tokio::sync::mpsc;

/// Notice that a freeze action has completed and its data is immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezeNotice {
    pub project: String,
    pub pathname: String,
    pub action_id: String,
}

/// Sending half held by the core service.
#[derive(Debug, Clone)]
pub struct FreezeNotifier {
    tx: mpsc::UnboundedSender<FreezeNotice>,
}

impl FreezeNotifier {
    /// Creates a notifier and the receiver downstream agents consume.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FreezeNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publishes a notice. A missing consumer is not an error: the freeze
    /// itself has already committed, and the log records the drop.
    pub fn publish(&self, notice: FreezeNotice) {
        if self.tx.send(notice.clone()).is_err() {
            tracing::warn!(
                project = %notice.project,
                pathname = %notice.pathname,
                action_id = %notice.action_id,
                "No consumer for freeze notice, dropping"
            );
        }
    }
}
