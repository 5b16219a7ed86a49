//! The units of work the task queue dispatches to the extended-query and
//! close sub-state machines.

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::protocol::types::Oid;
use crate::row::{ColumnDescriptor, Row};

/// Channel capacity for a single query's row stream. Bounds how far the
/// producer (the connection actor) can run ahead of the consumer; once full,
/// the actor stops issuing further socket reads until the consumer drains it.
pub const ROW_CHANNEL_CAPACITY: usize = 64;

/// Settles a task's outcome exactly once. Dropping the sink without settling
/// it (e.g. the actor panicking) surfaces as a `RecvError` on the receiving
/// end, which callers map to [`Error::ActorGone`].
pub type ResultSink<T> = oneshot::Sender<Result<T>>;

/// Which statement a query targets.
#[derive(Debug, Clone)]
pub enum QuerySource {
    /// Unnamed statement: Parse, then Bind/Describe/Execute/Sync.
    Sql(String),
    /// Previously prepared statement, addressed by its wire name: just
    /// Bind/Describe/Execute/Sync.
    Prepared(String),
}

/// What the extended-query sub-state machine reports back before any rows
/// (or in place of rows, for statements with no result columns).
#[derive(Debug)]
pub enum QueryStart {
    /// Result set columns, row streaming follows on `rows_tx`.
    Columns(Vec<ColumnDescriptor>),
    /// No result columns at all (e.g. plain `UPDATE`); the command tag is
    /// already final, no row stream will follow.
    NoRows(String),
}

/// An event forwarded from the connection actor to a query's row stream.
#[derive(Debug)]
pub enum RowEvent {
    /// One decoded row.
    Row(Row),
    /// The portal ran to completion; carries the command tag.
    Complete(String),
    /// The portal failed; no further rows will follow.
    Error(Error),
}

/// Enqueued by `Connection::query`/`Connection::query_prepared`.
pub struct ExtendedQueryTask {
    /// Statement to run.
    pub statement: QuerySource,
    /// Number of bound parameters.
    pub param_count: usize,
    /// Pre-encoded, length-prefixed binary parameter payload, ready to splice
    /// directly into the `Bind` message body.
    pub encoded_params: Vec<u8>,
    /// Settled once, with the column list or a no-rows command tag.
    pub first: ResultSink<QueryStart>,
    /// Row events are forwarded here after `first` resolves with columns.
    pub rows_tx: mpsc::Sender<RowEvent>,
}

/// Enqueued by `Connection::prepare`.
pub struct PrepareTask {
    /// SQL text to parse.
    pub sql: String,
    /// Parameter type OIDs to request (empty lets the server infer).
    pub param_oids: Vec<Oid>,
    /// Name this statement will be known by on the wire, chosen by the
    /// caller before the task is enqueued so the returned
    /// [`PreparedStatement`] can carry it immediately.
    pub wire_name: String,
    /// Settled once.
    pub sink: ResultSink<StatementDescription>,
}

/// Result of preparing a statement.
#[derive(Debug, Clone)]
pub struct StatementDescription {
    /// Parameter type OIDs, as reported by `ParameterDescription`.
    pub param_oids: Vec<Oid>,
    /// Result columns, as reported by `RowDescription` (empty if `NoData`).
    pub columns: Vec<ColumnDescriptor>,
}

/// A prepared statement handle, addressable by its wire name.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub(crate) wire_name: String,
    /// Parameter type OIDs.
    pub param_oids: Vec<Oid>,
    /// Result columns.
    pub columns: Vec<ColumnDescriptor>,
}

impl PreparedStatement {
    /// The server-visible statement name this handle refers to.
    pub fn wire_name(&self) -> &str {
        &self.wire_name
    }
}

/// What to close: a named prepared statement or a named portal.
#[derive(Debug, Clone)]
pub enum CloseTarget {
    /// Close a prepared statement by wire name.
    Statement(String),
    /// Close a portal by name.
    Portal(String),
}

/// Enqueued by `Connection::close_statement`/`Connection::close_portal`.
pub struct CloseTask {
    /// What to close.
    pub target: CloseTarget,
    /// Settled once.
    pub sink: ResultSink<()>,
}

/// A unit of work dispatched from the task queue, one at a time, only while
/// the connection is idle at `ReadyForQuery`.
pub enum Task {
    /// Run Parse?/Bind/Describe/Execute/Sync.
    ExtendedQuery(ExtendedQueryTask),
    /// Run Parse/Describe/Sync to prepare a statement.
    PrepareStatement(PrepareTask),
    /// Run Close/Sync against a statement or portal.
    Close(CloseTask),
}
