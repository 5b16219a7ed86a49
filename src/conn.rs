//! The connection actor: owns the transport and the state machines, and
//! exposes a cloneable handle that submits [`Task`]s across a channel.
//!
//! Everything under `state/` is sans-I/O; this module is where an [`Action`]
//! actually becomes a socket write, a TLS handshake, or a send into a
//! caller's oneshot/row channel. The actor dequeues the next task only once
//! [`ConnectionStateMachine::is_idle`] is true, giving the task queue its
//! FIFO, one-at-a-time dispatch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};

use crate::buffer::BufferSet;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::frontend;
use crate::row_stream::RowStream;
use crate::state::{Action, AsyncMessage, ConnectionStateMachine};
use crate::task::{
    CloseTarget, CloseTask, ExtendedQueryTask, PrepareTask, PreparedStatement, QueryStart,
    QuerySource, RowEvent, StatementDescription, Task,
};
use crate::transport::Stream;
use crate::value::ToParams;

/// Capacity of the task queue. Callers awaiting a result naturally pace
/// themselves; this just bounds how many can queue up behind a slow one.
const TASK_CHANNEL_CAPACITY: usize = 32;

/// Delivers out-of-band server messages (notices, parameter changes,
/// `NOTIFY` deliveries) to a caller-supplied callback, invoked on the
/// connection actor's task.
pub type AsyncMessageHandler = Box<dyn FnMut(AsyncMessage) + Send + 'static>;

/// A handle to a running connection actor.
///
/// Cheap to clone: every clone shares the same task queue, so whatever work
/// arrives from any of them is serialized in arrival order.
#[derive(Clone)]
pub struct Connection {
    tasks: mpsc::Sender<Task>,
    next_statement_id: Arc<AtomicU64>,
}

impl Connection {
    /// Perform startup and authentication on `stream`, then spawn the
    /// background actor that drives the connection for its lifetime.
    ///
    /// `host` is only consulted if SSL negotiation upgrades the transport,
    /// to verify the server's certificate; plaintext connections ignore it.
    pub async fn connect(stream: Stream, host: &str, config: Config) -> Result<Self> {
        Self::connect_with_async_handler(stream, host, config, None).await
    }

    /// Like [`Self::connect`], additionally routing out-of-band server
    /// messages to `on_async`.
    pub async fn connect_with_async_handler(
        stream: Stream,
        host: &str,
        config: Config,
        on_async: Option<AsyncMessageHandler>,
    ) -> Result<Self> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (task_tx, task_rx) = mpsc::channel(TASK_CHANNEL_CAPACITY);

        let host = host.to_string();
        tokio::spawn(run(stream, host, config, task_rx, ready_tx, on_async));

        ready_rx.await.map_err(|_| Error::ActorGone)??;

        Ok(Self {
            tasks: task_tx,
            next_statement_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Run `sql` with no bound parameters, streaming the result set.
    pub async fn query(&self, sql: impl Into<String>) -> Result<RowStream> {
        self.query_with(sql, &()).await
    }

    /// Run `sql` with `params` bound, streaming the result set.
    pub async fn query_with(
        &self,
        sql: impl Into<String>,
        params: &impl ToParams,
    ) -> Result<RowStream> {
        self.run_extended_query(QuerySource::Sql(sql.into()), params)
            .await
    }

    /// Execute a statement prepared earlier via [`Self::prepare`].
    pub async fn query_prepared(
        &self,
        statement: &PreparedStatement,
        params: &impl ToParams,
    ) -> Result<RowStream> {
        self.run_extended_query(
            QuerySource::Prepared(statement.wire_name().to_string()),
            params,
        )
        .await
    }

    async fn run_extended_query(
        &self,
        statement: QuerySource,
        params: &impl ToParams,
    ) -> Result<RowStream> {
        let param_count = params.param_count();
        check_param_count(param_count)?;

        let mut encoded_params = Vec::new();
        params.to_binary(&mut encoded_params);

        let (first_tx, first_rx) = oneshot::channel();
        let (row_tx, row_rx) = mpsc::channel(crate::task::ROW_CHANNEL_CAPACITY);

        self.send(Task::ExtendedQuery(ExtendedQueryTask {
            statement,
            param_count,
            encoded_params,
            first: first_tx,
            rows_tx: row_tx,
        }))
        .await?;

        match first_rx.await.map_err(|_| Error::ActorGone)?? {
            QueryStart::Columns(columns) => Ok(RowStream::new(columns, row_rx)),
            QueryStart::NoRows(tag) => Ok(RowStream::already_complete(tag)),
        }
    }

    /// Parse and describe `sql`, returning a reusable handle. `param_oids`
    /// may be left empty to let the server infer parameter types.
    pub async fn prepare(
        &self,
        sql: impl Into<String>,
        param_oids: Vec<crate::protocol::types::Oid>,
    ) -> Result<PreparedStatement> {
        let wire_name = format!("s{}", self.next_statement_id.fetch_add(1, Ordering::Relaxed));

        let (sink, recv) = oneshot::channel();
        self.send(Task::PrepareStatement(PrepareTask {
            sql: sql.into(),
            param_oids,
            wire_name: wire_name.clone(),
            sink,
        }))
        .await?;

        let StatementDescription {
            param_oids,
            columns,
        } = recv.await.map_err(|_| Error::ActorGone)??;

        Ok(PreparedStatement {
            wire_name,
            param_oids,
            columns,
        })
    }

    /// Close a prepared statement, releasing server-side resources.
    pub async fn close_statement(&self, statement: &PreparedStatement) -> Result<()> {
        self.close(CloseTarget::Statement(statement.wire_name().to_string()))
            .await
    }

    /// Close a named portal.
    pub async fn close_portal(&self, name: impl Into<String>) -> Result<()> {
        self.close(CloseTarget::Portal(name.into())).await
    }

    async fn close(&self, target: CloseTarget) -> Result<()> {
        let (sink, recv) = oneshot::channel();
        self.send(Task::Close(CloseTask { target, sink })).await?;
        recv.await.map_err(|_| Error::ActorGone)?
    }

    async fn send(&self, task: Task) -> Result<()> {
        self.tasks.send(task).await.map_err(|_| Error::ActorGone)
    }
}

/// Sinks belonging to whatever task is currently occupying the connection's
/// sub-state machine, if any.
enum CurrentTask {
    None,
    Query {
        first: Option<oneshot::Sender<Result<QueryStart>>>,
        rows_tx: mpsc::Sender<RowEvent>,
    },
    Prepare(oneshot::Sender<Result<StatementDescription>>),
    Close(oneshot::Sender<Result<()>>),
}

impl CurrentTask {
    /// Settle whatever sink is outstanding with `err`. Used when the actor
    /// itself is giving up (I/O error, protocol violation) rather than for
    /// the state machine's own `FailQuery`/`FailPrepare`/`FailClose`.
    fn fail(self, err: Error) {
        match self {
            CurrentTask::None => {}
            CurrentTask::Query { first, rows_tx } => match first {
                Some(first) => {
                    let _ = first.send(Err(err));
                }
                None => {
                    let _ = rows_tx.try_send(RowEvent::Error(err));
                }
            },
            CurrentTask::Prepare(sink) => {
                let _ = sink.send(Err(err));
            }
            CurrentTask::Close(sink) => {
                let _ = sink.send(Err(err));
            }
        }
    }
}

/// The actor's entire lifetime: drive startup to completion (reporting the
/// outcome via `ready_tx`), then alternate between dequeuing the next task
/// while idle and servicing unsolicited server messages, running each task's
/// sub-state machine to completion before accepting the next one.
async fn run(
    stream: Stream,
    host: String,
    config: Config,
    mut tasks: mpsc::Receiver<Task>,
    ready_tx: oneshot::Sender<Result<()>>,
    mut on_async: Option<AsyncMessageHandler>,
) {
    let mut buffers = BufferSet::new();
    let mut current = CurrentTask::None;

    let (mut csm, action) = match ConnectionStateMachine::new(config) {
        Ok(pair) => pair,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    let mut stream = match drive(
        &mut csm,
        stream,
        &host,
        &mut buffers,
        &mut on_async,
        &mut current,
        action,
    )
    .await
    {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(error = %err, "connection startup failed");
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    loop {
        debug_assert!(csm.is_idle());

        let task = tokio::select! {
            biased;
            task = tasks.recv() => task,
            result = stream.read_message(&mut buffers) => {
                match result.and_then(|()| csm.step(buffers.type_byte, &buffers.read_buffer)) {
                    Ok(Action::DeliverAsyncAndRead(msg)) => {
                        deliver(&mut on_async, msg);
                        continue;
                    }
                    Ok(other) => {
                        tracing::warn!(action = ?other, "unexpected action while idle");
                        return;
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "connection closed while idle");
                        return;
                    }
                }
            }
        };

        let Some(task) = task else {
            let mut buf = Vec::new();
            frontend::write_terminate(&mut buf);
            let _ = stream.write_all(&buf).await;
            return;
        };

        let action = begin(&mut csm, &mut current, task);
        stream = match drive(
            &mut csm,
            stream,
            &host,
            &mut buffers,
            &mut on_async,
            &mut current,
            action,
        )
        .await
        {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, "connection actor exiting");
                std::mem::replace(&mut current, CurrentTask::None).fail(err);
                return;
            }
        };
    }
}

/// Build the wire bytes for `task` and record its sinks in `current`.
fn begin(csm: &mut ConnectionStateMachine, current: &mut CurrentTask, task: Task) -> Action {
    match task {
        Task::ExtendedQuery(task) => {
            let action = csm.begin_query(&task);
            let ExtendedQueryTask { first, rows_tx, .. } = task;
            *current = CurrentTask::Query {
                first: Some(first),
                rows_tx,
            };
            action
        }
        Task::PrepareStatement(task) => {
            let action = csm.begin_prepare(&task, &task.wire_name);
            let PrepareTask { sink, .. } = task;
            *current = CurrentTask::Prepare(sink);
            action
        }
        Task::Close(task) => {
            let action = csm.begin_close(&task);
            let CloseTask { sink, .. } = task;
            *current = CurrentTask::Close(sink);
            action
        }
    }
}

fn deliver(on_async: &mut Option<AsyncMessageHandler>, msg: AsyncMessage) {
    if let Some(handler) = on_async {
        handler(msg);
    }
}

/// `Bind`'s parameter-count fields are signed 16-bit integers; reject a
/// caller-supplied count that can't fit before it gets anywhere near the
/// wire encoding.
fn check_param_count(count: usize) -> Result<()> {
    if count > i16::MAX as usize {
        return Err(Error::TooManyParameters(count));
    }
    Ok(())
}

/// Drive `action` and every action it leads to, performing the I/O or
/// channel send each one describes, until the connection reaches a stable
/// point: startup finished ([`Action::FireReadyForStartup`]) or the current
/// task ran to completion ([`Action::FireReadyForQuery`]).
async fn drive(
    csm: &mut ConnectionStateMachine,
    mut stream: Stream,
    host: &str,
    buffers: &mut BufferSet,
    on_async: &mut Option<AsyncMessageHandler>,
    current: &mut CurrentTask,
    mut action: Action,
) -> Result<Stream> {
    loop {
        action = match action {
            Action::SendStartup(params) => {
                let refs: Vec<(&str, &str)> =
                    params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                let mut buf = Vec::new();
                frontend::write_startup(&mut buf, &refs);
                stream.write_all(&buf).await?;
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::SendSSLRequest => {
                let mut buf = Vec::new();
                frontend::write_ssl_request(&mut buf);
                stream.write_all(&buf).await?;
                let byte = stream.read_ssl_response().await?;
                csm.step_ssl_response(byte)?
            }
            Action::EstablishSSL => {
                #[cfg(feature = "tls")]
                {
                    stream = stream.upgrade_to_tls(host).await?;
                }
                #[cfg(not(feature = "tls"))]
                {
                    let _ = host;
                    return Err(Error::Unsupported(
                        "server requested TLS upgrade but the `tls` feature is not enabled".into(),
                    ));
                }
                csm.step_tls_established()
            }
            Action::SendPassword { bytes, .. } => {
                let password = String::from_utf8(bytes)
                    .map_err(|e| Error::Protocol(format!("password bytes not utf8: {e}")))?;
                let mut buf = Vec::new();
                frontend::write_password(&mut buf, &password);
                stream.write_all(&buf).await?;
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::SendSaslInitial { mechanism, bytes } => {
                let mut buf = Vec::new();
                frontend::auth::write_sasl_initial_response(&mut buf, mechanism, &bytes);
                stream.write_all(&buf).await?;
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::SendSaslResponse(bytes) => {
                let mut buf = Vec::new();
                frontend::auth::write_sasl_response(&mut buf, &bytes);
                stream.write_all(&buf).await?;
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::SendParseBindDescribeExecuteSync(buf)
            | Action::SendBindDescribeExecuteSync(buf)
            | Action::SendParseDescribeSync(buf)
            | Action::SendCloseSync(buf) => {
                stream.write_all(&buf).await?;
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::SucceedQuery(columns) => {
                settle_first(current, Ok(QueryStart::Columns(columns)));
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::SucceedQueryNoRows(tag) => {
                settle_first(current, Ok(QueryStart::NoRows(tag)));
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::FailQuery(err) => {
                settle_first(current, Err(err));
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::ForwardRows(rows) => {
                if let CurrentTask::Query { rows_tx, .. } = &*current {
                    for row in rows {
                        if rows_tx.send(RowEvent::Row(row)).await.is_err() {
                            break;
                        }
                    }
                }
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::ForwardStreamComplete(tag) => {
                if let CurrentTask::Query { rows_tx, .. } = &*current {
                    let _ = rows_tx.send(RowEvent::Complete(tag)).await;
                }
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::ForwardStreamError(err) => {
                if let CurrentTask::Query { rows_tx, .. } = &*current {
                    let _ = rows_tx.send(RowEvent::Error(err)).await;
                }
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::SucceedPrepare(desc) => {
                if let CurrentTask::Prepare(sink) = std::mem::replace(current, CurrentTask::None) {
                    let _ = sink.send(Ok(desc));
                }
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::FailPrepare(err) => {
                if let CurrentTask::Prepare(sink) = std::mem::replace(current, CurrentTask::None) {
                    let _ = sink.send(Err(err));
                }
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::SucceedClose => {
                if let CurrentTask::Close(sink) = std::mem::replace(current, CurrentTask::None) {
                    let _ = sink.send(Ok(()));
                }
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::FailClose(err) => {
                if let CurrentTask::Close(sink) = std::mem::replace(current, CurrentTask::None) {
                    let _ = sink.send(Err(err));
                }
                read_and_step(csm, &mut stream, buffers).await?
            }
            // `Config.password` is read directly; there is no separate
            // context round trip to resolve.
            Action::ProvideAuthContext => read_and_step(csm, &mut stream, buffers).await?,
            Action::FireReadyForStartup => return Ok(stream),
            Action::FireReadyForQuery => {
                *current = CurrentTask::None;
                return Ok(stream);
            }
            // Neither of these two is produced by any state machine's `step()`
            // today: a connection-level error is surfaced as `Err` from
            // `step()` directly (see `read_and_step`), which this loop's `?`
            // already propagates as a broken connection without needing a
            // dedicated `Action` for it. Kept in the total `Action` match
            // (like `Wait` below) as the natural place a future state machine
            // that wants to close the transport mid-drive without going
            // through `Result::Err` would plug in.
            Action::CloseConnection => {
                let mut buf = Vec::new();
                frontend::write_terminate(&mut buf);
                stream.write_all(&buf).await?;
                return Err(Error::ConnectionBroken);
            }
            Action::FireChannelInactive => return Err(Error::ConnectionBroken),
            Action::DeliverAsyncAndRead(msg) => {
                deliver(on_async, msg);
                read_and_step(csm, &mut stream, buffers).await?
            }
            Action::Read => read_and_step(csm, &mut stream, buffers).await?,
            // Never produced by any state machine in this crate; treated as
            // "nothing pending" rather than matched exhaustively against a
            // variant that can't occur.
            Action::Wait => return Ok(stream),
        };
    }
}

fn settle_first(current: &mut CurrentTask, result: Result<QueryStart>) {
    if let CurrentTask::Query { first, .. } = current {
        if let Some(sink) = first.take() {
            let _ = sink.send(result);
        }
    }
}

async fn read_and_step(
    csm: &mut ConnectionStateMachine,
    stream: &mut Stream,
    buffers: &mut BufferSet,
) -> Result<Action> {
    stream.read_message(buffers).await?;
    csm.step(buffers.type_byte, &buffers.read_buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_param_count_is_accepted() {
        assert!(check_param_count(i16::MAX as usize).is_ok());
    }

    #[test]
    fn over_max_param_count_is_rejected() {
        let err = check_param_count(i16::MAX as usize + 1).unwrap_err();
        assert!(matches!(err, Error::TooManyParameters(32768)));
    }
}
