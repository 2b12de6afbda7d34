use crate::schema::{Channel, StagedMessage};
use std::future::Future;
use tracing::info;

/// The provider's answer to a single send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The provider accepted the message.
    Accepted {
        /// Provider-assigned message identifier.
        message_id: String,
    },
    /// The message could not be sent.
    Failed {
        /// Provider or transport error code.
        error_code: String,
    },
}

impl SendOutcome {
    /// Shorthand for [`SendOutcome::Accepted`].
    pub fn accepted(message_id: impl Into<String>) -> Self {
        Self::Accepted {
            message_id: message_id.into(),
        }
    }

    /// Shorthand for [`SendOutcome::Failed`].
    pub fn failed(error_code: impl Into<String>) -> Self {
        Self::Failed {
            error_code: error_code.into(),
        }
    }

    /// Whether the provider accepted the message.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Transport that actually delivers a message over a channel.
///
/// Implementations are called concurrently for the messages of a batch and
/// must report failures as [`SendOutcome::Failed`] instead of panicking;
/// panics are still caught and recorded as an error code.
pub trait ChannelSender: Send + Sync + 'static {
    /// Send one message.
    fn send(
        &self,
        channel: Channel,
        message: &StagedMessage,
    ) -> impl Future<Output = SendOutcome> + Send;
}

/// Sender that only logs messages and accepts all of them.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunSender;

impl ChannelSender for DryRunSender {
    async fn send(&self, channel: Channel, message: &StagedMessage) -> SendOutcome {
        info!(
            %channel,
            campaign.id = message.campaign_id,
            recipient = %message.recipient,
            "Dry run: not sending message"
        );
        SendOutcome::accepted(format!("dry-run-{channel}-{}", message.id))
    }
}
