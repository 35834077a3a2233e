//! Fan-out of unsolicited agent notifications and session lifecycle events.
//!
//! Receive tasks publish here; services subscribe to the topics they care
//! about. Delivery is per-subscriber FIFO and never blocks the publisher, so a
//! slow service cannot stall an agent's stream.

use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;

use crate::{
    AgentId, CloseReason, SessionId,
    message::{ActionResult, JobProgress, JobResult, StateChanged},
};

/// What happened.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A session became `Active`.
    SessionOpened,
    /// A session reached `Closed`.
    SessionClosed(CloseReason),
    StateChanged(StateChanged),
    ActionResult(ActionResult),
    JobProgress(JobProgress),
    JobResult(JobResult),
}

impl AgentEvent {
    /// Topic the event is routed by.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::SessionOpened | Self::SessionClosed(_) => Topic::Lifecycle,
            Self::StateChanged(_) => Topic::State,
            Self::ActionResult(_) => Topic::Actions,
            Self::JobProgress(_) | Self::JobResult(_) => Topic::Jobs,
        }
    }
}

/// Routing key of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Lifecycle,
    State,
    Actions,
    Jobs,
}

/// An event, tagged with the agent and session it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub agent_id: AgentId,
    pub session_id: SessionId,
    pub event: AgentEvent,
}

struct Subscriber {
    topics: Vec<Topic>,
    tx: mpsc::UnboundedSender<Notification>,
}

/// Topic-routed notification hub.
#[derive(Default)]
pub struct NotificationHub {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl NotificationHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the given topics.
    ///
    /// The subscription ends when the receiver is dropped.
    #[must_use]
    pub fn subscribe(&self, topics: &[Topic]) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                topics: topics.to_vec(),
                tx,
            });
        rx
    }

    /// Deliver a notification to every subscriber of its topic.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, notification: Notification) -> usize {
        let topic = notification.event.topic();
        let mut delivered = 0;
        let mut stale = false;
        {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for sub in subscribers.iter().filter(|s| s.topics.contains(&topic)) {
                if sub.tx.send(notification.clone()).is_ok() {
                    delivered += 1;
                } else {
                    stale = true;
                }
            }
        }
        if stale {
            self.subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|s| !s.tx.is_closed());
        }
        if delivered == 0 {
            tracing::trace!(agent_id = %notification.agent_id, ?topic, "No subscribers for notification");
        }
        delivered
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }
}
