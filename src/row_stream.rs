//! The row-batch stream: the consumer side of a running query's result set.

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::row::{ColumnDescriptor, Row};
use crate::task::RowEvent;

/// Terminal outcome of a row stream, cached after the first terminal event so
/// repeated calls after exhaustion keep returning it instead of hanging on a
/// closed channel.
#[derive(Debug, Clone)]
enum Finished {
    Complete(String),
    Failed(Error),
    Cancelled,
}

/// Streams decoded rows from a running portal.
///
/// Backed by a bounded channel fed by the connection actor: the channel's own
/// capacity *is* the pull-based backpressure window described by the
/// connection's extended-query sub-state machine. While the channel has
/// spare capacity the actor keeps reading and forwarding rows; once it fills
/// up the actor's next send blocks, which is observed on the wire as the
/// socket simply not being read further until this stream's consumer catches
/// up.
pub struct RowStream {
    columns: Vec<ColumnDescriptor>,
    rows: mpsc::Receiver<RowEvent>,
    finished: Option<Finished>,
}

impl RowStream {
    pub(crate) fn new(columns: Vec<ColumnDescriptor>, rows: mpsc::Receiver<RowEvent>) -> Self {
        Self {
            columns,
            rows,
            finished: None,
        }
    }

    /// A stream that never produces rows, already complete with `tag`.
    ///
    /// Used for statements whose `Describe` reported no result columns at
    /// all (the `SucceedQueryNoRows` case) — there is nothing to stream.
    pub(crate) fn already_complete(tag: String) -> Self {
        let (_tx, rx) = mpsc::channel(1);
        Self {
            columns: Vec::new(),
            rows: rx,
            finished: Some(Finished::Complete(tag)),
        }
    }

    /// Result set column descriptions.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// The command tag (e.g. `"SELECT 3"`), available once the stream has
    /// run to completion.
    pub fn command_tag(&self) -> Option<&str> {
        match &self.finished {
            Some(Finished::Complete(tag)) => Some(tag),
            _ => None,
        }
    }

    /// Pull the next row, or `None` once the portal completes.
    ///
    /// Returns the stored error on every call after a failure, matching the
    /// invariant that a failed stream stays failed rather than silently
    /// resuming.
    pub async fn next(&mut self) -> Option<Result<Row>> {
        if let Some(finished) = &self.finished {
            return match finished {
                Finished::Complete(_) | Finished::Cancelled => None,
                Finished::Failed(err) => Some(Err(clone_error(err))),
            };
        }

        match self.rows.recv().await {
            Some(RowEvent::Row(row)) => Some(Ok(row)),
            Some(RowEvent::Complete(tag)) => {
                self.finished = Some(Finished::Complete(tag));
                None
            }
            Some(RowEvent::Error(err)) => {
                let out = clone_error(&err);
                self.finished = Some(Finished::Failed(err));
                Some(Err(out))
            }
            None => {
                // Actor dropped the sender without a terminal event: it died
                // mid-stream.
                self.finished = Some(Finished::Failed(Error::ActorGone));
                Some(Err(Error::ActorGone))
            }
        }
    }

    /// Drain every remaining row into a `Vec`.
    ///
    /// If the stream already carries a stored error (from a prior `next()`
    /// call, or because the portal failed before any row was pulled), that
    /// error is returned immediately without attempting to read further.
    pub async fn all(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Invoke `f` for each row as it arrives, returning the command tag once
    /// the portal completes.
    pub async fn on_row<F: FnMut(Row)>(&mut self, mut f: F) -> Result<String> {
        while let Some(row) = self.next().await {
            f(row?);
        }
        match &self.finished {
            Some(Finished::Complete(tag)) => Ok(tag.clone()),
            Some(Finished::Cancelled) => Err(Error::InvalidUsage("stream was cancelled".into())),
            Some(Finished::Failed(err)) => Err(clone_error(err)),
            None => unreachable!("next() always sets `finished` before returning None"),
        }
    }

    /// Stop consuming. The connection actor notices the receiver has been
    /// dropped and discards the remaining rows on the wire itself so the
    /// portal's Sync round trip can still complete; this does not send a
    /// PostgreSQL `CancelRequest` and does not abort a query already
    /// executing on the server.
    pub fn cancel(&mut self) {
        if self.finished.is_none() {
            self.finished = Some(Finished::Cancelled);
        }
        self.rows.close();
    }
}

fn clone_error(err: &Error) -> Error {
    // `Error` isn't `Clone` (some variants wrap non-Clone sources), so a
    // stored error is re-materialized as an equivalent `Protocol`/`Server`
    // error on replay rather than cloned verbatim.
    match err {
        Error::Server(server_error) => Error::Server(server_error.clone()),
        other => Error::Protocol(other.to_string()),
    }
}

/// Producer-side handle used by the connection actor to push row events.
///
/// A thin wrapper so the actor's send call sites read as what they are:
/// pushing into someone else's stream, not writing to the wire.
pub(crate) struct RowSink {
    tx: mpsc::Sender<RowEvent>,
}

impl RowSink {
    pub(crate) fn new(tx: mpsc::Sender<RowEvent>) -> Self {
        Self { tx }
    }

    /// Forward one row, pacing on channel capacity. Returns `Err` once the
    /// consumer has dropped/cancelled the stream.
    pub(crate) async fn send(&self, event: RowEvent) -> std::result::Result<(), ()> {
        self.tx.send(event).await.map_err(|_| ())
    }
}

/// Creates a linked row-event channel: an actor-facing [`RowSink`] and the
/// receiving half a [`RowStream`] is built from.
pub(crate) fn channel() -> (RowSink, mpsc::Receiver<RowEvent>) {
    let (tx, rx) = mpsc::channel(crate::task::ROW_CHANNEL_CAPACITY);
    (RowSink::new(tx), rx)
}

/// Re-exported for callers settling a `first` sink with `Err` before any row
/// channel is created.
pub(crate) fn first_sink<T>() -> (oneshot::Sender<Result<T>>, oneshot::Receiver<Result<T>>) {
    oneshot::channel()
}
