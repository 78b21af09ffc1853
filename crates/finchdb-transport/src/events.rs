//! Command lifecycle events.
//!
//! Every command round trip emits `started` before the frame is written and
//! exactly one of `succeeded` or `failed` afterwards; fire-and-forget sends
//! synthesize an immediate success. The command document shown in events is
//! re-decoded from the already-serialized frame rather than re-traversing the
//! caller's document. Security-sensitive commands have their bodies replaced
//! with an empty document so listeners never observe credentials.

use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::{doc, Document};
use tracing::{debug, Level};

use crate::error::TransportError;

const TARGET: &str = "finchdb_transport::command";

/// Identifying fields shared by all events for one command.
#[derive(Debug, Clone)]
pub struct CommandMeta {
    /// Pool-local connection id.
    pub connection_id: u64,
    /// Server address.
    pub address: String,
    /// Request id stamped on the outbound message.
    pub request_id: i32,
    /// Target database.
    pub database: String,
    /// Command name.
    pub command_name: String,
}

/// Emitted before the command frame is written.
#[derive(Debug, Clone)]
pub struct CommandStartedEvent {
    /// Shared identifying fields.
    pub meta: CommandMeta,
    /// The command document as serialized, or empty when redacted.
    pub command: Document,
}

/// Emitted after a successful round trip.
#[derive(Debug, Clone)]
pub struct CommandSucceededEvent {
    /// Shared identifying fields.
    pub meta: CommandMeta,
    /// Round-trip duration.
    pub duration: Duration,
    /// The reply document, or empty when redacted.
    pub reply: Document,
}

/// Emitted when a round trip fails.
#[derive(Debug, Clone)]
pub struct CommandFailedEvent {
    /// Shared identifying fields.
    pub meta: CommandMeta,
    /// Time spent before the failure.
    pub duration: Duration,
    /// Rendered failure; generic for redacted commands.
    pub failure: String,
}

/// Receives command lifecycle events. All methods default to no-ops.
pub trait CommandListener: Send + Sync {
    /// A command is about to be written.
    fn command_started(&self, _event: &CommandStartedEvent) {}
    /// A command round trip completed.
    fn command_succeeded(&self, _event: &CommandSucceededEvent) {}
    /// A command round trip failed.
    fn command_failed(&self, _event: &CommandFailedEvent) {}
}

/// Tracks one command from `started` to its terminal event.
///
/// Consuming the span in `succeeded`/`failed` makes emitting both, or
/// neither, unrepresentable.
pub struct CommandSpan {
    inner: Option<SpanInner>,
}

struct SpanInner {
    meta: CommandMeta,
    redacted: bool,
    started_at: Instant,
}

/// Emits command events to an optional listener and the debug log.
///
/// With no listener and debug logging disabled the sender is inert: the
/// command document is never materialized.
#[derive(Clone, Default)]
pub struct CommandEventSender {
    listener: Option<Arc<dyn CommandListener>>,
}

impl CommandEventSender {
    /// A sender reporting to `listener`.
    pub fn new(listener: Arc<dyn CommandListener>) -> Self {
        Self {
            listener: Some(listener),
        }
    }

    /// A sender with no listener; only debug logging remains.
    pub fn disabled() -> Self {
        Self { listener: None }
    }

    /// Whether any consumer would observe an event.
    pub fn is_observing(&self) -> bool {
        self.listener.is_some() || tracing::enabled!(target: TARGET, Level::DEBUG)
    }

    /// Emits the started event, decoding the command document from the
    /// serialized `frame`. The frame is only borrowed for this call; the
    /// caller is free to compress or release it afterwards.
    pub fn started(
        &self,
        meta: CommandMeta,
        frame: &[u8],
        command_range: Range<usize>,
        redacted: bool,
    ) -> CommandSpan {
        if !self.is_observing() {
            return CommandSpan { inner: None };
        }
        let command = if redacted {
            Document::new()
        } else {
            Document::from_reader(&mut &frame[command_range]).unwrap_or_default()
        };
        debug!(
            target: TARGET,
            request_id = meta.request_id,
            connection_id = meta.connection_id,
            address = meta.address.as_str(),
            database = meta.database.as_str(),
            command = meta.command_name.as_str(),
            "command started"
        );
        if let Some(listener) = &self.listener {
            listener.command_started(&CommandStartedEvent {
                meta: meta.clone(),
                command,
            });
        }
        CommandSpan {
            inner: Some(SpanInner {
                meta,
                redacted,
                started_at: Instant::now(),
            }),
        }
    }

    /// Emits the succeeded event with the reply document.
    pub fn succeeded(&self, span: CommandSpan, reply: &Document) {
        let inner = match span.inner {
            Some(inner) => inner,
            None => return,
        };
        let duration = inner.started_at.elapsed();
        debug!(
            target: TARGET,
            request_id = inner.meta.request_id,
            command = inner.meta.command_name.as_str(),
            duration_ms = duration.as_millis() as u64,
            "command succeeded"
        );
        if let Some(listener) = &self.listener {
            let reply = if inner.redacted {
                Document::new()
            } else {
                reply.clone()
            };
            listener.command_succeeded(&CommandSucceededEvent {
                meta: inner.meta,
                duration,
                reply,
            });
        }
    }

    /// Emits the succeeded event for a fire-and-forget send, with a
    /// synthesized `{ok: 1}` reply.
    pub fn succeeded_one_way(&self, span: CommandSpan) {
        self.succeeded(span, &doc! { "ok": 1 });
    }

    /// Emits the failed event.
    pub fn failed(&self, span: CommandSpan, error: &TransportError) {
        let inner = match span.inner {
            Some(inner) => inner,
            None => return,
        };
        let duration = inner.started_at.elapsed();
        let failure = match error {
            // A redacted command failure must not leak server error text.
            TransportError::CommandFailure { code, .. } if inner.redacted => {
                format!(
                    "command {} failed with code {code}",
                    inner.meta.command_name
                )
            }
            other => other.to_string(),
        };
        debug!(
            target: TARGET,
            request_id = inner.meta.request_id,
            command = inner.meta.command_name.as_str(),
            duration_ms = duration.as_millis() as u64,
            failure = failure.as_str(),
            "command failed"
        );
        if let Some(listener) = &self.listener {
            listener.command_failed(&CommandFailedEvent {
                meta: inner.meta,
                duration,
                failure,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        started: Mutex<Vec<CommandStartedEvent>>,
        succeeded: Mutex<Vec<CommandSucceededEvent>>,
        failed: Mutex<Vec<CommandFailedEvent>>,
    }

    impl CommandListener for Recorder {
        fn command_started(&self, event: &CommandStartedEvent) {
            self.started.lock().unwrap().push(event.clone());
        }
        fn command_succeeded(&self, event: &CommandSucceededEvent) {
            self.succeeded.lock().unwrap().push(event.clone());
        }
        fn command_failed(&self, event: &CommandFailedEvent) {
            self.failed.lock().unwrap().push(event.clone());
        }
    }

    fn meta() -> CommandMeta {
        CommandMeta {
            connection_id: 3,
            address: "db1:27017".to_string(),
            request_id: 9,
            database: "app".to_string(),
            command_name: "find".to_string(),
        }
    }

    fn serialized(document: &Document) -> Vec<u8> {
        let mut bytes = Vec::new();
        document.to_writer(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_started_decodes_from_frame() {
        let recorder = Arc::new(Recorder::default());
        let sender = CommandEventSender::new(recorder.clone());

        let document = doc! { "find": "users", "$db": "app" };
        let frame = serialized(&document);
        let span = sender.started(meta(), &frame, 0..frame.len(), false);
        sender.succeeded(span, &doc! { "ok": 1 });

        let started = recorder.started.lock().unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].command, document);
        assert_eq!(started[0].meta.request_id, 9);
        let succeeded = recorder.succeeded.lock().unwrap();
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].reply.get_i32("ok").unwrap(), 1);
    }

    #[test]
    fn test_sensitive_command_redacted() {
        let recorder = Arc::new(Recorder::default());
        let sender = CommandEventSender::new(recorder.clone());

        let document = doc! { "saslStart": 1, "payload": "secret" };
        let frame = serialized(&document);
        let mut meta = meta();
        meta.command_name = "saslStart".to_string();
        let span = sender.started(meta, &frame, 0..frame.len(), true);
        sender.succeeded(span, &doc! { "ok": 1, "payload": "server-secret" });

        let started = recorder.started.lock().unwrap();
        assert!(started[0].command.is_empty());
        let succeeded = recorder.succeeded.lock().unwrap();
        assert!(succeeded[0].reply.is_empty());
    }

    #[test]
    fn test_redacted_failure_hides_server_message() {
        let recorder = Arc::new(Recorder::default());
        let sender = CommandEventSender::new(recorder.clone());

        let document = doc! { "saslStart": 1 };
        let frame = serialized(&document);
        let mut meta = meta();
        meta.command_name = "saslStart".to_string();
        let span = sender.started(meta, &frame, 0..frame.len(), true);
        let error = TransportError::CommandFailure {
            name: "saslStart".to_string(),
            code: 18,
            message: "credential detail".to_string(),
            labels: vec![],
            response: doc! { "ok": 0 },
        };
        sender.failed(span, &error);

        let failed = recorder.failed.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert!(!failed[0].failure.contains("credential detail"));
        assert!(failed[0].failure.contains("18"));
    }

    #[test]
    fn test_one_way_synthesizes_ok() {
        let recorder = Arc::new(Recorder::default());
        let sender = CommandEventSender::new(recorder.clone());

        let document = doc! { "insert": "logs" };
        let frame = serialized(&document);
        let span = sender.started(meta(), &frame, 0..frame.len(), false);
        sender.succeeded_one_way(span);

        let succeeded = recorder.succeeded.lock().unwrap();
        assert_eq!(succeeded[0].reply, doc! { "ok": 1 });
    }

    #[test]
    fn test_disabled_sender_is_inert() {
        let sender = CommandEventSender::disabled();
        assert!(!sender.is_observing());
        let span = sender.started(meta(), &[], 0..0, false);
        // No listener, no debug subscriber: nothing decodes, nothing panics.
        sender.succeeded(span, &doc! { "ok": 1 });
    }
}
