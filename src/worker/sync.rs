//! Background sync.
//!
//! Fired when connectivity returns. Replaying actions queued while offline
//! is not implemented yet: the registered tag is acknowledged after a fixed
//! delay and nothing else happens.

use tracing::{debug, info};

use super::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The tag was ours and the sync routine ran to completion.
    Completed,
    /// The tag belongs to someone else.
    Ignored,
}

impl Worker {
    pub async fn handle_sync(&self, tag: &str) -> SyncOutcome {
        info!(tag, "background sync");
        if tag != self.config().sync_tag {
            debug!(tag, "sync tag not handled");
            return SyncOutcome::Ignored;
        }
        self.sync_offline_actions().await;
        SyncOutcome::Completed
    }

    async fn sync_offline_actions(&self) {
        info!("syncing offline actions");
        tokio::time::sleep(self.config().sync_delay()).await;
        info!("offline actions synced");
    }
}
