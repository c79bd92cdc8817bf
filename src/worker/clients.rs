//! The environment the worker reports to: controlled pages and the system
//! notification tray.

use tracing::info;
use url::Url;

use super::push::Notification;

/// Side effects the worker asks its host to perform.
///
/// A browser would implement these with `clients.claim()`,
/// `clients.openWindow()` and `registration.showNotification()`. The proxy
/// has no windows or tray, so it uses [`LoggingHost`].
pub trait ClientHost: Send + Sync {
    /// Takes control of already-open pages. Returns how many were claimed.
    fn claim(&self) -> usize;

    /// Opens `url` in a new window. Existing windows are not reused.
    fn open_window(&self, url: &Url);

    fn show_notification(&self, notification: &Notification);

    fn close_notification(&self, notification: &Notification);
}

/// [`ClientHost`] that only records what it was asked to do in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHost;

impl ClientHost for LoggingHost {
    fn claim(&self) -> usize {
        info!("claiming open clients");
        0
    }

    fn open_window(&self, url: &Url) {
        info!(url = %url, "open window requested");
    }

    fn show_notification(&self, notification: &Notification) {
        info!(title = %notification.title, body = %notification.body, "notification shown");
    }

    fn close_notification(&self, notification: &Notification) {
        info!(title = %notification.title, "notification closed");
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex;

    use super::*;

    /// Captures every host call for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingHost {
        pub claims: Mutex<usize>,
        pub opened: Mutex<Vec<Url>>,
        pub shown: Mutex<Vec<Notification>>,
        pub closed: Mutex<usize>,
    }

    impl ClientHost for RecordingHost {
        fn claim(&self) -> usize {
            *self.claims.lock().unwrap() += 1;
            1
        }

        fn open_window(&self, url: &Url) {
            self.opened.lock().unwrap().push(url.clone());
        }

        fn show_notification(&self, notification: &Notification) {
            self.shown.lock().unwrap().push(notification.clone());
        }

        fn close_notification(&self, _notification: &Notification) {
            *self.closed.lock().unwrap() += 1;
        }
    }
}
