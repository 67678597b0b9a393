//! Run progress events
//!
//! The coordinator publishes a [`RunEvent`] at each step of a run. Anyone
//! may subscribe; a slow or absent subscriber never stalls the run, events
//! that do not fit its channel are dropped for that subscriber.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::probe::ProfileKind;

const CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        root_target: String,
        profile: ProfileKind,
        probes: Vec<String>,
    },
    ProbeStarted {
        probe: String,
        targets: usize,
    },
    PairFailed {
        probe: String,
        target: String,
        error: String,
    },
    IdentityUnified {
        survivor: String,
        retired: Vec<String>,
        asserted_by: String,
    },
    ProbeCompleted {
        probe: String,
        ok: usize,
        partial: usize,
        failed: usize,
        skipped: usize,
    },
    RunCompleted {
        run_id: Uuid,
        identities: usize,
        deadline_reached: bool,
    },
}

pub struct EventBus {
    subscribers: RwLock<Vec<mpsc::Sender<RunEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub async fn subscribe(&self) -> mpsc::Receiver<RunEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers.write().await.push(tx);
        rx
    }

    pub async fn publish(&self, event: RunEvent) {
        let mut disconnected = false;
        {
            let subscribers = self.subscribers.read().await;
            for sender in subscribers.iter() {
                match sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!("Event subscriber lagging, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => disconnected = true,
                }
            }
        }

        if disconnected {
            self.subscribers
                .write()
                .await
                .retain(|sender| !sender.is_closed());
            tracing::debug!("Removed disconnected event subscribers");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}
