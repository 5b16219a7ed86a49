//! Async PostgreSQL wire-protocol client core.
//!
//! This crate implements the connection and extended-query state machines
//! of the frontend/backend protocol as sans-I/O types: they decide what to
//! send and how to interpret what comes back, but never touch a socket
//! themselves. [`conn::Connection`] is the thin actor that drives them
//! against a real [`transport::Stream`].
//!
//! Value encoding/decoding, connection pooling, and the simple-query and
//! `COPY` sub-protocols are intentionally out of scope; callers implement
//! [`value::ToParams`]/[`value::FromValue`] for their own types, or use the
//! scalar impls provided for quick testing.
//!
//! # Example
//!
//! ```no_run
//! use pg_proto_core::{Config, Connection};
//! use pg_proto_core::transport::Stream;
//! use tokio::net::TcpStream;
//!
//! # async fn run() -> pg_proto_core::Result<()> {
//! let tcp = TcpStream::connect("localhost:5432").await?;
//! let stream = Stream::tcp(tcp);
//! let config = Config::new("postgres").database("mydb").password("secret");
//!
//! let conn = Connection::connect(stream, "localhost", config).await?;
//! let mut rows = conn.query("SELECT 1").await?;
//! while let Some(row) = rows.next().await {
//!     let row = row?;
//! }
//! # Ok(())
//! # }
//! ```

mod buffer;
mod conn;
pub mod config;
pub mod error;
pub mod protocol;
pub mod row;
pub mod row_stream;
pub mod state;
pub mod task;
pub mod transport;
pub mod value;

pub use conn::{AsyncMessageHandler, Connection};
pub use config::{Config, SslMode};
pub use error::{Error, Result, ServerError};
pub use row::{ColumnDescriptor, FromRow, Row};
pub use row_stream::RowStream;
pub use state::action::AsyncMessage;
pub use task::PreparedStatement;
pub use value::{FromValue, ToParams, ToValue};
