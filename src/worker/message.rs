//! Messages posted to the worker by pages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::Worker;

/// Commands a page can send, tagged by their `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Activate without waiting for old pages to close.
    SkipWaiting,
    /// Reply with the generation label on the supplied port.
    GetVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: String,
}

/// Reply channel handed over alongside a message.
pub type ReplyPort = oneshot::Sender<VersionReply>;

impl Worker {
    /// Handles one message. Anything that is not a known command is logged
    /// and ignored.
    pub fn handle_message(&self, message: &Value, port: Option<ReplyPort>) {
        debug!(message = %message, "message received");

        let Ok(command) = WorkerMessage::deserialize(message) else {
            info!(message = %message, "ignoring unrecognized message");
            return;
        };

        match command {
            WorkerMessage::SkipWaiting => self.skip_waiting(),
            WorkerMessage::GetVersion => {
                let Some(port) = port else {
                    warn!("GET_VERSION sent without a reply port");
                    return;
                };
                let reply = VersionReply {
                    version: self.version().to_owned(),
                };
                if port.send(reply).is_err() {
                    debug!("GET_VERSION requester went away before the reply");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;
    use crate::worker::testing::harness;

    #[test]
    fn wire_format() {
        let msg: WorkerMessage = serde_json::from_value(json!({ "type": "SKIP_WAITING" })).unwrap();
        assert_eq!(msg, WorkerMessage::SkipWaiting);
        assert_eq!(
            serde_json::to_value(WorkerMessage::GetVersion).unwrap(),
            json!({ "type": "GET_VERSION" })
        );
    }

    #[tokio::test]
    async fn get_version_replies_on_port() {
        let h = harness();
        let (tx, rx) = oneshot::channel();
        h.worker.handle_message(&json!({ "type": "GET_VERSION" }), Some(tx));
        let reply = rx.await.unwrap();
        assert_eq!(reply.version, "butha-buthe-library-v1");
        assert_eq!(serde_json::to_value(&reply).unwrap(), json!({ "version": "butha-buthe-library-v1" }));
    }

    #[tokio::test]
    async fn skip_waiting_sets_flag() {
        let h = harness();
        h.worker.handle_message(&json!({ "type": "SKIP_WAITING" }), None);
        assert!(h.worker.is_skipping_waiting());
    }

    #[tokio::test]
    async fn unknown_and_malformed_messages_are_ignored() {
        let h = harness();
        h.worker.handle_message(&json!({ "type": "CLEAR_EVERYTHING" }), None);
        h.worker.handle_message(&json!("SKIP_WAITING"), None);
        h.worker.handle_message(&json!(null), None);
        assert!(!h.worker.is_skipping_waiting());
    }
}
