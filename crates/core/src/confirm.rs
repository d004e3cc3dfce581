use std::time::Duration;

use tracing::debug;

use crate::Result;
use crate::model::Id;
use crate::remote::{IncomingMessage, ReplySource};

pub const DEFAULT_CONFIRM_TOKEN: &str = "CONFIRM";
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Confirmed,
    Declined,
    TimedOut,
}

/// Bounded wait for an exact confirmation token from the actor who asked
/// for the restore, in the channel they asked from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationGate {
    token: String,
    timeout: Duration,
}

impl Default for ConfirmationGate {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIRM_TOKEN, DEFAULT_CONFIRM_TIMEOUT)
    }
}

impl ConfirmationGate {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            token: token.into(),
            timeout,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `None` for messages that are not a reply at all (other actor or
    /// channel). Any reply that is not exactly the token declines.
    pub fn classify(
        &self,
        message: &IncomingMessage,
        actor_id: Id,
        channel_id: Id,
    ) -> Option<GateOutcome> {
        if message.author_id != actor_id || message.channel_id != channel_id {
            return None;
        }
        if message.content == self.token {
            Some(GateOutcome::Confirmed)
        } else {
            Some(GateOutcome::Declined)
        }
    }

    pub async fn wait(
        &self,
        replies: &dyn ReplySource,
        actor_id: Id,
        channel_id: Id,
    ) -> Result<GateOutcome> {
        let waited = tokio::time::timeout(self.timeout, async {
            loop {
                let Some(message) = replies.next_reply().await? else {
                    return Ok(GateOutcome::TimedOut);
                };
                match self.classify(&message, actor_id, channel_id) {
                    Some(outcome) => return Ok(outcome),
                    None => debug!(
                        event = "confirm.ignored",
                        author_id = message.author_id,
                        channel_id = message.channel_id,
                        "confirm.ignored"
                    ),
                }
            }
        })
        .await;

        match waited {
            Ok(outcome) => outcome,
            Err(_) => Ok(GateOutcome::TimedOut),
        }
    }
}
