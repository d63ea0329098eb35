use async_trait::async_trait;
use uuid::Uuid;

/// Delivery of session summaries. Senders may deliver twice; nothing here
/// deduplicates.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn session_summary(&self, session_id: Uuid) -> anyhow::Result<()>;
}

/// Records the request in the log instead of sending mail.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn session_summary(&self, session_id: Uuid) -> anyhow::Result<()> {
        log::info!("session summary requested for {}", session_id);
        Ok(())
    }
}
