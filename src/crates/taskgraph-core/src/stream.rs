//! Streaming events and per-edge channels
//!
//! A streaming task produces a lazy sequence of [`StreamEvent`]s ending in
//! exactly one `Finish` (carrying the aggregate output) or `Error`. The runner
//! forwards those events along dataflow edges through bounded
//! producer-consumer channels - backpressure is the channel capacity - and,
//! where the edge requires it, folds them into a materialized value with a
//! [`StreamAccumulator`].
//!
//! # Wire form
//!
//! Events serialize as compact tagged objects:
//!
//! ```json
//! {"type": "text-delta", "textDelta": "alp"}
//! {"type": "snapshot", "data": {...}}
//! {"type": "finish", "data": {...}}
//! {"type": "error", "err": "..."}
//! ```

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Result, TaskGraphError};
use crate::schema::StreamMode;

/// Default bound of per-edge stream channels
pub const DEFAULT_STREAM_CAPACITY: usize = 64;

/// One chunk of a streaming output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// Incremental text; accumulates under [`StreamMode::Append`]
    TextDelta {
        /// The appended text fragment
        #[serde(rename = "textDelta")]
        text_delta: String,
    },
    /// Full intermediate value; replaces under [`StreamMode::Replace`]
    Snapshot {
        /// The replacement value
        data: Value,
    },
    /// Terminal event carrying the aggregate output
    Finish {
        /// The final value
        data: Value,
    },
    /// Terminal failure
    Error {
        /// Failure message
        #[serde(rename = "err")]
        error: String,
    },
}

impl StreamEvent {
    /// Whether this event ends the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finish { .. } | StreamEvent::Error { .. })
    }
}

/// Lazy sequence of stream events produced by a task
pub type TaskEventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Sending half of a per-edge stream channel
#[derive(Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<StreamEvent>,
}

impl StreamSender {
    /// Send one event, waiting while the channel is full
    ///
    /// Errors with [`TaskGraphError::Cancelled`] once the consumer is gone,
    /// which is how cancellation reaches a producer mid-stream.
    pub async fn send(&self, event: StreamEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| TaskGraphError::cancelled())
    }

    /// Convenience: send a text delta
    pub async fn delta(&self, text: impl Into<String>) -> Result<()> {
        self.send(StreamEvent::TextDelta {
            text_delta: text.into(),
        })
        .await
    }

    /// Convenience: send a snapshot
    pub async fn snapshot(&self, data: Value) -> Result<()> {
        self.send(StreamEvent::Snapshot { data }).await
    }

    /// Convenience: send the terminal finish event
    pub async fn finish(&self, data: Value) -> Result<()> {
        self.send(StreamEvent::Finish { data }).await
    }
}

/// Receiving half of a per-edge stream channel
pub struct StreamReceiver {
    rx: mpsc::Receiver<StreamEvent>,
}

impl StreamReceiver {
    /// Await the next event (`None` once the producer is done)
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Adapt into a `futures::Stream`
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        ReceiverStream::new(self.rx)
    }
}

/// Create a bounded stream channel
pub fn stream_channel(capacity: usize) -> (StreamSender, StreamReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StreamSender { tx }, StreamReceiver { rx })
}

/// Build a chunk sequence from text deltas plus the final aggregate
///
/// Convenience for handlers whose streaming output is a fixed text split;
/// production handlers usually generate chunks on the fly instead.
pub fn text_delta_stream(deltas: Vec<String>, final_output: Value) -> TaskEventStream {
    Box::pin(async_stream::stream! {
        for delta in deltas {
            yield Ok(StreamEvent::TextDelta { text_delta: delta });
        }
        yield Ok(StreamEvent::Finish { data: final_output });
    })
}

/// Folds stream events into a materialized port value
///
/// The fold obeys the *target's* stream mode:
/// - `Append`: text deltas concatenate; a snapshot resets the accumulation
/// - `Replace`: the latest snapshot wins; deltas append to a text buffer that
///   becomes the value if no snapshot arrived
/// - `None`: only the `Finish` payload matters
///
/// `Finish` with a non-null payload always overrides the running
/// accumulation - the producer's aggregate is authoritative.
#[derive(Debug)]
pub struct StreamAccumulator {
    mode: StreamMode,
    text: String,
    snapshot: Option<Value>,
    finished: Option<Value>,
    error: Option<String>,
}

impl StreamAccumulator {
    /// Start an empty accumulation for `mode`
    pub fn new(mode: StreamMode) -> Self {
        Self {
            mode,
            text: String::new(),
            snapshot: None,
            finished: None,
            error: None,
        }
    }

    /// Fold one event
    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta { text_delta } => {
                self.text.push_str(text_delta);
            }
            StreamEvent::Snapshot { data } => {
                if self.mode == StreamMode::Append {
                    self.text.clear();
                }
                self.snapshot = Some(data.clone());
            }
            StreamEvent::Finish { data } => {
                self.finished = Some(data.clone());
            }
            StreamEvent::Error { error } => {
                self.error = Some(error.clone());
            }
        }
    }

    /// Whether a terminal event has been folded
    pub fn is_finished(&self) -> bool {
        self.finished.is_some() || self.error.is_some()
    }

    /// The value as accumulated so far (before finish)
    pub fn current(&self) -> Value {
        if let Some(snapshot) = &self.snapshot {
            return snapshot.clone();
        }
        if self.text.is_empty() && self.mode == StreamMode::None {
            Value::Null
        } else {
            Value::String(self.text.clone())
        }
    }

    /// Consume the accumulator, producing the final value
    ///
    /// Errors if the stream ended with `Error` or never finished.
    pub fn into_final(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(TaskGraphError::Transient(error));
        }
        match self.finished {
            None => Err(TaskGraphError::Fatal(
                "stream ended without a finish event".to_string(),
            )),
            Some(Value::Null) if self.snapshot.is_some() || !self.text.is_empty() => {
                Ok(match self.snapshot {
                    Some(snapshot) => snapshot,
                    None => Value::String(self.text),
                })
            }
            Some(data) => Ok(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serde_matches_wire_format() {
        let delta = StreamEvent::TextDelta {
            text_delta: "alp".into(),
        };
        assert_eq!(
            serde_json::to_value(&delta).unwrap(),
            json!({"type": "text-delta", "textDelta": "alp"})
        );

        let error = StreamEvent::Error {
            error: "boom".into(),
        };
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"type": "error", "err": "boom"})
        );

        let parsed: StreamEvent =
            serde_json::from_value(json!({"type": "finish", "data": {"text": "done"}})).unwrap();
        assert_eq!(
            parsed,
            StreamEvent::Finish {
                data: json!({"text": "done"})
            }
        );
    }

    #[test]
    fn append_accumulates_deltas() {
        let mut acc = StreamAccumulator::new(StreamMode::Append);
        acc.apply(&StreamEvent::TextDelta { text_delta: "alp".into() });
        acc.apply(&StreamEvent::TextDelta { text_delta: "ha".into() });
        assert_eq!(acc.current(), json!("alpha"));

        acc.apply(&StreamEvent::Finish { data: Value::Null });
        assert_eq!(acc.into_final().unwrap(), json!("alpha"));
    }

    #[test]
    fn finish_payload_is_authoritative() {
        let mut acc = StreamAccumulator::new(StreamMode::Append);
        acc.apply(&StreamEvent::TextDelta { text_delta: "partial".into() });
        acc.apply(&StreamEvent::Finish { data: json!("complete") });
        assert_eq!(acc.into_final().unwrap(), json!("complete"));
    }

    #[test]
    fn replace_takes_latest_snapshot() {
        let mut acc = StreamAccumulator::new(StreamMode::Replace);
        acc.apply(&StreamEvent::Snapshot { data: json!({"v": 1}) });
        acc.apply(&StreamEvent::Snapshot { data: json!({"v": 2}) });
        assert_eq!(acc.current(), json!({"v": 2}));
        acc.apply(&StreamEvent::Finish { data: Value::Null });
        assert_eq!(acc.into_final().unwrap(), json!({"v": 2}));
    }

    #[test]
    fn error_event_fails_the_fold() {
        let mut acc = StreamAccumulator::new(StreamMode::None);
        acc.apply(&StreamEvent::Error { error: "upstream".into() });
        assert!(acc.is_finished());
        assert!(acc.into_final().is_err());
    }

    #[test]
    fn unfinished_stream_is_an_error() {
        let acc = StreamAccumulator::new(StreamMode::None);
        assert!(matches!(
            acc.into_final().unwrap_err(),
            TaskGraphError::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn channel_roundtrip_with_backpressure() {
        let (tx, mut rx) = stream_channel(2);
        tx.delta("a").await.unwrap();
        tx.finish(json!("a")).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::TextDelta { text_delta: "a".into() })
        );
        assert!(matches!(rx.recv().await, Some(StreamEvent::Finish { .. })));
        drop(rx);
        // Consumer gone reads as cancellation.
        assert!(tx.delta("late").await.is_err());
    }
}
