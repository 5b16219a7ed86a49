//! Sans-I/O state machines for the PostgreSQL protocol.
//!
//! None of these types perform I/O. Each `step` call hands back an [`Action`]
//! describing what the connection actor should do next — write these bytes,
//! read a message, hand over to the caller — and is called again once that
//! action has been carried out. This keeps every protocol decision testable
//! without a socket.

pub mod action;
pub mod close;
pub mod connection;
pub mod extended;

pub use action::{Action, AsyncMessage, AuthMode};
pub use close::CloseStateMachine;
pub use connection::ConnectionStateMachine;
pub use extended::{PrepareStateMachine, QueryStateMachine};
