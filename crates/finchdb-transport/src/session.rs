//! Session and causal-consistency context attached to commands.
//!
//! The codec consults (never owns) this state when building a message, and
//! the connection feeds server-observed times back into it after each reply.
//! Cluster time and operation time only ever move forward.

use std::time::{Duration, Instant};

use bson::{doc, Bson, Document, Timestamp};

/// Where reads may be routed. Injected into commands as `$readPreference`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    /// Reads go to the primary only.
    #[default]
    Primary,
    /// Prefer the primary, fall back to a secondary.
    PrimaryPreferred,
    /// Reads go to a secondary only.
    Secondary,
    /// Prefer a secondary, fall back to the primary.
    SecondaryPreferred,
    /// Reads go to the lowest-latency member.
    Nearest,
}

impl ReadPreference {
    /// The mode name as it appears on the wire.
    pub fn mode(&self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::PrimaryPreferred => "primaryPreferred",
            ReadPreference::Secondary => "secondary",
            ReadPreference::SecondaryPreferred => "secondaryPreferred",
            ReadPreference::Nearest => "nearest",
        }
    }

    /// Whether this preference permits reads from a non-primary member.
    pub fn allows_secondary_reads(&self) -> bool {
        !matches!(self, ReadPreference::Primary)
    }

    /// The `$readPreference` document form.
    pub fn to_document(&self) -> Document {
        doc! { "mode": self.mode() }
    }
}

/// A point in time after which an operation should stop waiting.
///
/// Used to derive the `maxTimeMS` hint sent with a command.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never expires.
    pub fn infinite() -> Self {
        Deadline(None)
    }

    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline(Some(Instant::now() + timeout))
    }

    /// Time remaining, or `None` for an infinite deadline. Saturates at zero.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed.
    pub fn has_expired(&self) -> bool {
        matches!(self.remaining(), Some(rem) if rem.is_zero())
    }
}

/// Per-operation session state: logical session id, causal-consistency
/// clocks, and transaction bookkeeping.
///
/// Owned by the caller of `send_and_receive`; a session must not be shared
/// across interleaved connections.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    session_id: Option<Document>,
    cluster_time: Option<Document>,
    operation_time: Option<Timestamp>,
    transaction_number: Option<i64>,
    in_transaction: bool,
    message_sent_in_transaction: bool,
    read_concern: Option<Document>,
    deadline: Deadline,
}

impl SessionState {
    /// A session context with no logical session attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a logical session id (an `lsid` document).
    pub fn with_session_id(mut self, session_id: Document) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// The logical session id, if one is attached.
    pub fn session_id(&self) -> Option<&Document> {
        self.session_id.as_ref()
    }

    /// The highest cluster time observed so far.
    pub fn cluster_time(&self) -> Option<&Document> {
        self.cluster_time.as_ref()
    }

    /// The highest operation time observed so far.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Advances the cluster time if `candidate` is newer. Never moves the
    /// clock backward.
    pub fn advance_cluster_time(&mut self, candidate: &Document) {
        let candidate_ts = match extract_cluster_timestamp(candidate) {
            Some(ts) => ts,
            None => return,
        };
        let newer = match self.cluster_time.as_ref().and_then(extract_cluster_timestamp) {
            Some(current) => timestamp_key(candidate_ts) > timestamp_key(current),
            None => true,
        };
        if newer {
            self.cluster_time = Some(candidate.clone());
        }
    }

    /// Advances the operation time if `candidate` is newer.
    pub fn advance_operation_time(&mut self, candidate: Timestamp) {
        match self.operation_time {
            Some(current) if timestamp_key(current) >= timestamp_key(candidate) => {}
            _ => self.operation_time = Some(candidate),
        }
    }

    /// Begins a transaction with the given number. The next message sent is
    /// the transaction's first statement.
    pub fn start_transaction(&mut self, number: i64) {
        self.transaction_number = Some(number);
        self.in_transaction = true;
        self.message_sent_in_transaction = false;
    }

    /// Ends the active transaction, if any.
    pub fn end_transaction(&mut self) {
        self.in_transaction = false;
    }

    /// Whether a transaction is active.
    pub fn has_active_transaction(&self) -> bool {
        self.in_transaction
    }

    /// The active transaction number.
    pub fn transaction_number(&self) -> Option<i64> {
        self.transaction_number.filter(|_| self.in_transaction)
    }

    /// Records that a message is being sent, returning `true` when it is the
    /// first statement of the active transaction.
    pub fn notify_message_sent(&mut self) -> bool {
        if self.in_transaction && !self.message_sent_in_transaction {
            self.message_sent_in_transaction = true;
            return true;
        }
        false
    }

    /// The read concern to attach to the transaction's first statement.
    pub fn read_concern(&self) -> Option<&Document> {
        self.read_concern.as_ref()
    }

    /// Sets the read concern document.
    pub fn set_read_concern(&mut self, read_concern: Option<Document>) {
        self.read_concern = read_concern;
    }

    /// The operation deadline used to derive `maxTimeMS`.
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Sets the operation deadline.
    pub fn set_deadline(&mut self, deadline: Deadline) {
        self.deadline = deadline;
    }
}

fn extract_cluster_timestamp(cluster_time: &Document) -> Option<Timestamp> {
    match cluster_time.get("clusterTime") {
        Some(Bson::Timestamp(ts)) => Some(*ts),
        _ => None,
    }
}

fn timestamp_key(ts: Timestamp) -> (u32, u32) {
    (ts.time, ts.increment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_time(time: u32, increment: u32) -> Document {
        doc! { "clusterTime": Bson::Timestamp(Timestamp { time, increment }) }
    }

    #[test]
    fn test_cluster_time_moves_forward() {
        let mut session = SessionState::new();
        session.advance_cluster_time(&cluster_time(10, 1));
        session.advance_cluster_time(&cluster_time(12, 0));
        let held = session.cluster_time().unwrap();
        assert_eq!(held, &cluster_time(12, 0));
    }

    #[test]
    fn test_cluster_time_never_regresses() {
        let mut session = SessionState::new();
        session.advance_cluster_time(&cluster_time(12, 3));
        session.advance_cluster_time(&cluster_time(12, 2));
        session.advance_cluster_time(&cluster_time(5, 9));
        assert_eq!(session.cluster_time().unwrap(), &cluster_time(12, 3));
    }

    #[test]
    fn test_cluster_time_ignores_malformed() {
        let mut session = SessionState::new();
        session.advance_cluster_time(&doc! { "clusterTime": "not a timestamp" });
        assert!(session.cluster_time().is_none());
    }

    #[test]
    fn test_operation_time_monotonic() {
        let mut session = SessionState::new();
        session.advance_operation_time(Timestamp { time: 7, increment: 1 });
        session.advance_operation_time(Timestamp { time: 6, increment: 9 });
        assert_eq!(
            session.operation_time(),
            Some(Timestamp { time: 7, increment: 1 })
        );
    }

    #[test]
    fn test_first_statement_in_transaction() {
        let mut session = SessionState::new();
        assert!(!session.notify_message_sent());

        session.start_transaction(1);
        assert!(session.notify_message_sent());
        assert!(!session.notify_message_sent());

        session.start_transaction(2);
        assert!(session.notify_message_sent());
    }

    #[test]
    fn test_transaction_number_only_while_active() {
        let mut session = SessionState::new();
        session.start_transaction(42);
        assert_eq!(session.transaction_number(), Some(42));
        session.end_transaction();
        assert_eq!(session.transaction_number(), None);
    }

    #[test]
    fn test_deadline_remaining() {
        assert!(Deadline::infinite().remaining().is_none());
        assert!(!Deadline::infinite().has_expired());

        let deadline = Deadline::after(Duration::from_secs(60));
        let remaining = deadline.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(!deadline.has_expired());

        let expired = Deadline::after(Duration::from_millis(0));
        assert!(expired.has_expired());
    }

    #[test]
    fn test_read_preference_documents() {
        assert_eq!(
            ReadPreference::SecondaryPreferred.to_document(),
            doc! { "mode": "secondaryPreferred" }
        );
        assert!(!ReadPreference::Primary.allows_secondary_reads());
        assert!(ReadPreference::Nearest.allows_secondary_reads());
    }
}
