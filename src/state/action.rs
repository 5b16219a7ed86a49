//! Action types returned by the state machines.
//!
//! A state machine never performs I/O itself: each call to `step` hands back
//! an [`Action`] describing what the driving loop (the connection actor)
//! should do next, then `step` is called again with the outcome. This keeps
//! every protocol decision testable without a socket.

use crate::error::{Error, ServerError};
use crate::row::{ColumnDescriptor, Row};
use crate::task::StatementDescription;

/// Which authentication challenge the server issued, carried alongside the
/// already-encoded response so the driving loop only has to write bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// `PasswordMessage` with the cleartext password.
    Cleartext,
    /// `PasswordMessage` with the MD5-hashed password.
    Md5,
}

/// Action requested by the connection state machine.
pub enum Action {
    /// Write a `StartupMessage` built from these parameters.
    SendStartup(Vec<(String, String)>),
    /// Write an `SSLRequest`, then read a single response byte.
    SendSSLRequest,
    /// The server accepted `SSLRequest`; perform the TLS handshake, then call
    /// `step` again.
    EstablishSSL,
    /// Write a `PasswordMessage` already encoded for `mode`.
    SendPassword { mode: AuthMode, bytes: Vec<u8> },
    /// Write a `SASLInitialResponse` for `mechanism`.
    SendSaslInitial {
        mechanism: &'static str,
        bytes: Vec<u8>,
    },
    /// Write a `SASLResponse`.
    SendSaslResponse(Vec<u8>),

    /// Write Parse+Bind+Describe(portal)+Execute+Sync (unnamed statement).
    SendParseBindDescribeExecuteSync(Vec<u8>),
    /// Write Bind+Describe(portal)+Execute+Sync (statement already prepared).
    SendBindDescribeExecuteSync(Vec<u8>),
    /// Write Parse+Describe(statement)+Sync (a `PrepareStatement` task).
    SendParseDescribeSync(Vec<u8>),
    /// Write Close+Sync against a statement or portal.
    SendCloseSync(Vec<u8>),

    /// A query produced a result set; deliver its columns and switch to
    /// row-forwarding.
    SucceedQuery(Vec<ColumnDescriptor>),
    /// A query produced no result set at all; deliver the command tag
    /// directly, no rows will follow.
    SucceedQueryNoRows(String),
    /// A query failed before any rows were produced.
    FailQuery(Error),
    /// Forward one decoded row to the query's row stream.
    ForwardRows(Vec<Row>),
    /// The row stream completed normally with this command tag.
    ForwardStreamComplete(String),
    /// The row stream failed mid-stream.
    ForwardStreamError(Error),

    /// A statement was prepared successfully.
    SucceedPrepare(StatementDescription),
    /// Preparing a statement failed.
    FailPrepare(Error),

    /// A Close completed successfully.
    SucceedClose,
    /// A Close failed.
    FailClose(Error),

    /// Authentication context (password) is needed; the caller must resolve
    /// it from `Config` and call back in with it.
    ProvideAuthContext,
    /// Startup/authentication finished; the connection is ready to accept
    /// its first task.
    FireReadyForStartup,
    /// The connection returned to `ReadyForQuery` with no sub-state machine
    /// active; the task queue may dispatch the next task.
    FireReadyForQuery,
    /// Write `Terminate` and close the transport.
    CloseConnection,
    /// The transport closed or became unusable; no further progress is
    /// possible.
    FireChannelInactive,
    /// Deliver an out-of-band server message to the caller, then read the
    /// next message and call `step` again.
    DeliverAsyncAndRead(AsyncMessage),
    /// Read one message from the transport, then call `step` again.
    Read,
    /// Nothing to do right now: wait for either the next inbound message or
    /// the next enqueued task, whichever comes first.
    Wait,
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::SendStartup(_) => "SendStartup",
            Action::SendSSLRequest => "SendSSLRequest",
            Action::EstablishSSL => "EstablishSSL",
            Action::SendPassword { .. } => "SendPassword",
            Action::SendSaslInitial { .. } => "SendSaslInitial",
            Action::SendSaslResponse(_) => "SendSaslResponse",
            Action::SendParseBindDescribeExecuteSync(_) => "SendParseBindDescribeExecuteSync",
            Action::SendBindDescribeExecuteSync(_) => "SendBindDescribeExecuteSync",
            Action::SendParseDescribeSync(_) => "SendParseDescribeSync",
            Action::SendCloseSync(_) => "SendCloseSync",
            Action::SucceedQuery(_) => "SucceedQuery",
            Action::SucceedQueryNoRows(_) => "SucceedQueryNoRows",
            Action::FailQuery(_) => "FailQuery",
            Action::ForwardRows(_) => "ForwardRows",
            Action::ForwardStreamComplete(_) => "ForwardStreamComplete",
            Action::ForwardStreamError(_) => "ForwardStreamError",
            Action::SucceedPrepare(_) => "SucceedPrepare",
            Action::FailPrepare(_) => "FailPrepare",
            Action::SucceedClose => "SucceedClose",
            Action::FailClose(_) => "FailClose",
            Action::ProvideAuthContext => "ProvideAuthContext",
            Action::FireReadyForStartup => "FireReadyForStartup",
            Action::FireReadyForQuery => "FireReadyForQuery",
            Action::CloseConnection => "CloseConnection",
            Action::FireChannelInactive => "FireChannelInactive",
            Action::DeliverAsyncAndRead(_) => "DeliverAsyncAndRead",
            Action::Read => "Read",
            Action::Wait => "Wait",
        };
        f.write_str(name)
    }
}

/// Asynchronous message the server can send outside of any request/response
/// sequence.
#[derive(Debug, Clone)]
pub enum AsyncMessage {
    /// `NOTIFY` delivery for a channel this connection is `LISTEN`ing on.
    Notification {
        /// PID of the notifying backend.
        pid: u32,
        /// Channel name.
        channel: String,
        /// Notification payload.
        payload: String,
    },
    /// Non-fatal notice.
    Notice(ServerError),
    /// A runtime parameter changed (e.g. `TimeZone`, `client_encoding`).
    ParameterChanged {
        /// Parameter name.
        name: String,
        /// New value.
        value: String,
    },
}
