//! Per-task progress/status pub-sub.
//!
//! One broadcast topic per task. Publishing never blocks the executor;
//! subscribers that fall behind lose intermediate progress events but the
//! terminal status is always the newest buffered value, and the most
//! recent event is retained for subscribers joining mid-execution.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use ferry_db::models::RunState;

/// Default per-topic buffer. Slow subscribers start dropping progress
/// events past this depth.
const TOPIC_CAPACITY: usize = 256;

/// Event published on a task's topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Progress {
        task_id: Uuid,
        percent: i32,
        phase: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows_processed: Option<u64>,
    },
    Status {
        task_id: Uuid,
        state: RunState,
        connection_lost: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    Connected {
        task_id: Uuid,
    },
    Error {
        task_id: Uuid,
        message: String,
    },
    ReconnectFailed {
        task_id: Uuid,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::Progress { task_id, .. }
            | Self::Status { task_id, .. }
            | Self::Connected { task_id }
            | Self::Error { task_id, .. }
            | Self::ReconnectFailed { task_id } => *task_id,
        }
    }

    /// Whether this event ends the task's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Status { state, .. } if state.is_terminal())
    }
}

/// Transport view of a task's topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Retrying,
    Closed,
}

struct Topic {
    sender: broadcast::Sender<TaskEvent>,
    last: Option<TaskEvent>,
}

/// Topic-per-task progress bus.
pub struct ProgressBus {
    topics: Mutex<HashMap<Uuid, Topic>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an event on the task's topic, creating it when absent.
    ///
    /// Non-blocking; an absent subscriber set is not an error.
    pub fn publish(&self, event: TaskEvent) {
        let task_id = event.task_id();
        let mut topics = self.topics.lock().expect("progress bus lock poisoned");
        let topic = topics.entry(task_id).or_insert_with(|| Topic {
            sender: broadcast::Sender::new(TOPIC_CAPACITY),
            last: None,
        });
        topic.last = Some(event.clone());
        // Err means no live receivers; the retained event still serves
        // late subscribers.
        let _ = topic.sender.send(event);
    }

    /// Subscribe to a task's topic.
    ///
    /// The subscription replays the retained event first (if any), so a
    /// subscriber joining mid-execution sees at least the latest state.
    pub fn subscribe(&self, task_id: Uuid) -> Subscription {
        let mut topics = self.topics.lock().expect("progress bus lock poisoned");
        let topic = topics.entry(task_id).or_insert_with(|| Topic {
            sender: broadcast::Sender::new(TOPIC_CAPACITY),
            last: None,
        });
        Subscription {
            initial: topic.last.clone(),
            receiver: topic.sender.subscribe(),
        }
    }

    /// Close a task's topic. Live subscribers drain buffered events (the
    /// terminal status among them) and then see end-of-stream.
    pub fn close(&self, task_id: Uuid) {
        self.topics
            .lock()
            .expect("progress bus lock poisoned")
            .remove(&task_id);
    }

    /// Drop every topic (process shutdown).
    pub fn close_all(&self) {
        self.topics
            .lock()
            .expect("progress bus lock poisoned")
            .clear();
    }

    pub fn connection_state(&self, task_id: Uuid) -> ConnectionState {
        let topics = self.topics.lock().expect("progress bus lock poisoned");
        match topics.get(&task_id) {
            None => ConnectionState::Closed,
            Some(topic) => match &topic.last {
                Some(TaskEvent::Status {
                    connection_lost: true,
                    state,
                    ..
                }) if !state.is_terminal() => ConnectionState::Retrying,
                Some(event) if event.is_terminal() => ConnectionState::Closed,
                _ => ConnectionState::Open,
            },
        }
    }

    /// Latest retained event for a task, if its topic is open.
    pub fn last_event(&self, task_id: Uuid) -> Option<TaskEvent> {
        self.topics
            .lock()
            .expect("progress bus lock poisoned")
            .get(&task_id)
            .and_then(|t| t.last.clone())
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription to one task's topic.
pub struct Subscription {
    initial: Option<TaskEvent>,
    receiver: broadcast::Receiver<TaskEvent>,
}

impl Subscription {
    /// Receive the next event.
    ///
    /// Lagged gaps are skipped (intermediate progress is droppable);
    /// `None` means the topic closed.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        if let Some(event) = self.initial.take() {
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "subscriber lagged; dropped progress events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Consume the subscription as a stream of events.
    pub fn into_stream(mut self) -> impl futures::Stream<Item = TaskEvent> {
        async_stream::stream! {
            while let Some(event) = self.next_event().await {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }
        }
    }
}
