//! Notification delivery. Sinks are fire-and-forget from the order's point of view.
use tracing::info;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub title: String,
    #[n(2)]
    pub message: String,
    #[n(3)]
    pub link: Option<String>,
}

impl Notification {
    pub fn new(
        user_id: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        link: Option<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            title: title.into(),
            message: message.into(),
            link,
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log. Used when no delivery channel is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(
            user_id = %notification.user_id,
            title = %notification.title,
            link = notification.link.as_deref().unwrap_or(""),
            "{}",
            notification.message
        );
        Ok(())
    }
}
