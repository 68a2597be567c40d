use async_trait::async_trait;
use shared::domain::UserId;
use storage::StoredMessage;
use tracing::debug;

/// Boundary to the external push-notification collaborator. Invoked by the
/// dispatcher whenever an eligible recipient has zero presence sessions at
/// dispatch time; the status row stays at `sent` either way, so replay
/// remains the source of truth.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn message_pending(&self, recipient: UserId, message: &StoredMessage);
}

/// Default notifier: records the handoff in the log and nothing else.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl PushNotifier for LogNotifier {
    async fn message_pending(&self, recipient: UserId, message: &StoredMessage) {
        debug!(
            recipient = recipient.0,
            message_id = message.message_id.0,
            "recipient fully offline, deferring to push notification"
        );
    }
}
