//! Push messages and notification clicks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{Worker, WorkerError};

/// The JSON a push message is expected to carry.
#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// A system notification as handed to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub data: Value,
    pub actions: Vec<NotificationAction>,
}

/// Action id that opens the application.
pub const VIEW_ACTION: &str = "view";
pub const DISMISS_ACTION: &str = "dismiss";

impl Worker {
    /// Displays a notification for a push message.
    ///
    /// An absent or empty payload shows nothing and returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// [`WorkerError::InvalidPush`] if the payload is not a JSON object with
    /// a string `title`.
    pub fn handle_push(&self, payload: Option<&[u8]>) -> Result<Option<Notification>, WorkerError> {
        let Some(raw) = payload.filter(|p| !p.is_empty()) else {
            debug!("push without payload ignored");
            return Ok(None);
        };
        let payload: PushPayload = serde_json::from_slice(raw)?;
        info!(title = %payload.title, "push notification received");

        let notification = Notification {
            title: payload.title,
            body: payload.body,
            icon: self.config().notification_icon.clone(),
            badge: self.config().notification_badge.clone(),
            data: payload
                .data
                .unwrap_or_else(|| Value::Object(Default::default())),
            actions: vec![
                NotificationAction {
                    action: VIEW_ACTION.to_string(),
                    title: "View".to_string(),
                },
                NotificationAction {
                    action: DISMISS_ACTION.to_string(),
                    title: "Dismiss".to_string(),
                },
            ],
        };

        self.host().show_notification(&notification);
        Ok(Some(notification))
    }

    /// Closes the clicked notification and, for the `view` action, opens the
    /// application root. Returns `true` if a window was opened.
    pub fn handle_notification_click(&self, notification: &Notification, action: &str) -> bool {
        info!(title = %notification.title, action, "notification clicked");
        self.host().close_notification(notification);

        if action == VIEW_ACTION {
            self.host().open_window(self.root_url());
            true
        } else {
            false
        }
    }
}
