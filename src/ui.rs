//! Console UI adapter and the close-requested signal.
//!
//! The interactive desktop surface is an external collaborator; the core only
//! talks to this thin adapter: a status line, printed event lines, the login
//! code prompt, and desktop notifications.

use std::sync::Arc;

use notify_rust::{Notification, Timeout};
use tokio::sync::watch;

use crate::error::{MinerError, Result};

// =============================================================================
// Close signal
// =============================================================================

/// Process-wide "close requested" event. All long awaits consult it through
/// [`CloseSignal::guard`] and bail out with `ExitRequest` on closure.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn request_close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once close has been requested.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run `fut` unless close is requested first, in which case the future
    /// is dropped and `ExitRequest` is returned.
    pub async fn guard<T>(&self, fut: impl std::future::Future<Output = T>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.closed() => Err(MinerError::ExitRequest),
            value = fut => Ok(value),
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Console UI
// =============================================================================

/// Console implementation of the UI surface the core consumes.
#[derive(Debug, Clone)]
pub struct Ui {
    close: CloseSignal,
    tray_notifications: bool,
}

impl Ui {
    pub fn new(close: CloseSignal, tray_notifications: bool) -> Self {
        Self {
            close,
            tray_notifications,
        }
    }

    pub fn close_signal(&self) -> &CloseSignal {
        &self.close
    }

    /// Replace the one-line status.
    pub fn status(&self, text: &str) {
        println!("[status] {text}");
    }

    /// Print an event line with a timestamp.
    pub fn print(&self, line: &str) {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        println!("{stamp}: {line}");
    }

    /// Show the device-code login prompt.
    pub fn ask_enter_code(&self, user_code: &str, verification_uri: &str) {
        self.print(&format!(
            "Open {verification_uri} and enter this code to log in: {user_code}"
        ));
        self.notify(
            &format!("Enter code {user_code} at {verification_uri}"),
            "Twitch Drops Miner login",
        );
    }

    pub fn login_update(&self, message: &str) {
        self.print(&format!("Login: {message}"));
    }

    /// Tray notification; falls back to a printed line when the desktop
    /// notification cannot be delivered.
    pub fn notify(&self, body: &str, title: &str) {
        if !self.tray_notifications {
            return;
        }
        let result = Notification::new()
            .summary(title)
            .body(body)
            .sound_name("message-new-instant")
            .timeout(Timeout::Milliseconds(10000))
            .show();
        if let Err(e) = result {
            tracing::debug!("Notification failed: {}", e);
            self.print(&format!("{title}: {body}"));
        }
    }

    pub fn set_watching(&self, channel_name: &str) {
        self.print(&format!("Now watching: {channel_name}"));
    }

    pub fn clear_watching(&self) {
        tracing::info!("Stopped watching");
    }

    /// The console adapter has no channel list to select from.
    pub fn get_selection(&self) -> Option<u64> {
        None
    }

    /// Show the currently mined drop on the status line.
    pub fn display_drop(&self, text: &str) {
        self.status(text);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_guard_passes_value_through() {
        let close = CloseSignal::new();
        let value = close.guard(async { 42 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_guard_aborts_on_close() {
        let close = CloseSignal::new();
        close.request_close();
        let result = close
            .guard(tokio::time::sleep(Duration::from_secs(60)))
            .await;
        assert!(matches!(result, Err(MinerError::ExitRequest)));
    }

    #[tokio::test]
    async fn test_closed_wakes_waiters() {
        let close = CloseSignal::new();
        let waiter = close.clone();
        let handle = tokio::spawn(async move {
            waiter.closed().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        close.request_close();
        assert!(handle.await.unwrap());
        assert!(close.is_closed());
    }
}
