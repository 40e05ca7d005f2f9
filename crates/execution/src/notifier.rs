use async_trait::async_trait;
use tracing::{debug, info, warn};
use tradegate_core::traits::{NotificationPriority, Notifier};

/// Routes notifications into the log, at a level chosen by priority.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier {
    channel: String,
}

impl TracingNotifier {
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, message: &str, priority: NotificationPriority) -> anyhow::Result<()> {
        match priority {
            NotificationPriority::Low => debug!(channel = %self.channel, "{message}"),
            NotificationPriority::Normal => info!(channel = %self.channel, "{message}"),
            NotificationPriority::High | NotificationPriority::Critical => {
                warn!(channel = %self.channel, ?priority, "{message}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_never_fails() {
        let notifier = TracingNotifier::new("trades");
        for priority in [
            NotificationPriority::Low,
            NotificationPriority::Normal,
            NotificationPriority::High,
            NotificationPriority::Critical,
        ] {
            assert!(notifier.send("SOL filled", priority).await.is_ok());
        }
    }
}
