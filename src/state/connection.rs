//! Connection state machine: startup, SSL negotiation, authentication,
//! parameter-status bookkeeping, and dispatch into the extended-query/
//! prepare/close sub-state machines once the server reaches `ReadyForQuery`.
//!
//! `step` is only ever called with a message the driving loop already framed
//! off the wire; the SSL negotiation byte and the post-handshake resume are
//! each driven through their own entry point since neither is a regular
//! length-prefixed message.

use crate::config::{Config, SslMode};
use crate::error::{Error, Result};
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, NegotiateProtocolVersion,
    ParameterStatus, RawMessage, ReadyForQuery, msg_type,
};
use crate::protocol::frontend::auth::{ScramClient, md5_password};
use crate::protocol::types::TransactionStatus;
use crate::task::{CloseTask, ExtendedQueryTask, PrepareTask, Task};

use super::action::{Action, AsyncMessage, AuthMode};
use super::close::CloseStateMachine;
use super::extended::{PrepareStateMachine, QueryStateMachine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingSslResponse,
    WaitingAuth,
    SaslInProgress,
    WaitingAuthResult,
    WaitingStartupReady,
    Idle,
}

/// Which sub-state machine, if any, currently owns the wire.
enum Sub {
    None,
    Query(QueryStateMachine),
    Prepare(PrepareStateMachine),
    Close(CloseStateMachine),
}

/// The top-level connection state machine.
///
/// Owns startup/authentication state until the first `ReadyForQuery`, then
/// becomes a thin dispatcher: every further message is either an async
/// out-of-band notice/notification/parameter change, or belongs to whichever
/// sub-state machine [`Self::begin_query`]/[`Self::begin_prepare`]/
/// [`Self::begin_close`] most recently started.
pub struct ConnectionStateMachine {
    state: State,
    config: Config,
    sub: Sub,
    backend_pid: u32,
    backend_secret: u32,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    scram_client: Option<ScramClient>,
}

impl ConnectionStateMachine {
    /// Start a new connection: decide whether to request SSL first, or go
    /// straight to `StartupMessage`.
    pub fn new(config: Config) -> Result<(Self, Action)> {
        let client_supports_tls = cfg!(feature = "tls");
        if config.ssl_mode == SslMode::Require && !client_supports_tls {
            return Err(Error::Unsupported(
                "SSL required but the `tls` feature is not enabled".into(),
            ));
        }

        let mut sm = Self {
            state: State::WaitingAuth,
            config,
            sub: Sub::None,
            backend_pid: 0,
            backend_secret: 0,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            scram_client: None,
        };

        let wants_ssl = matches!(
            sm.config.ssl_mode,
            SslMode::Require | SslMode::Prefer if client_supports_tls
        );

        let action = if wants_ssl {
            sm.state = State::WaitingSslResponse;
            Action::SendSSLRequest
        } else {
            sm.send_startup()
        };

        Ok((sm, action))
    }

    fn send_startup(&mut self) -> Action {
        self.state = State::WaitingAuth;
        let params = self
            .config
            .startup_params()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Action::SendStartup(params)
    }

    /// Resume after the driver read the single SSL negotiation byte.
    pub fn step_ssl_response(&mut self, byte: u8) -> Result<Action> {
        match byte {
            b'S' => Ok(Action::EstablishSSL),
            b'N' => {
                if self.config.ssl_mode == SslMode::Require {
                    return Err(Error::Auth("server rejected SSL negotiation".into()));
                }
                Ok(self.send_startup())
            }
            other => Err(Error::Protocol(format!(
                "unexpected SSL negotiation response byte '{}'",
                other as char
            ))),
        }
    }

    /// Resume after the driver completed the TLS handshake.
    pub fn step_tls_established(&mut self) -> Action {
        self.send_startup()
    }

    /// Whether the connection has reached `ReadyForQuery` with no sub-state
    /// machine active — the only moment the task queue may dispatch.
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle && matches!(self.sub, Sub::None)
    }

    /// Server-reported runtime parameters accumulated so far (`TimeZone`,
    /// `server_version`, ...), refreshed as `ParameterStatus` arrives.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Backend PID and secret key, needed to issue a `CancelRequest` on a
    /// second connection. Both are zero until startup completes.
    pub fn backend_key(&self) -> (u32, u32) {
        (self.backend_pid, self.backend_secret)
    }

    /// Transaction status as of the most recent `ReadyForQuery`.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Start running `task`. Only valid while [`Self::is_idle`] is true.
    pub fn begin_query(&mut self, task: &ExtendedQueryTask) -> Action {
        let (sm, action) = QueryStateMachine::start(task);
        self.sub = Sub::Query(sm);
        action
    }

    /// Start preparing `task`, naming the statement `wire_name` on the wire.
    pub fn begin_prepare(&mut self, task: &PrepareTask, wire_name: &str) -> Action {
        let (sm, action) = PrepareStateMachine::start(task, wire_name);
        self.sub = Sub::Prepare(sm);
        action
    }

    /// Start closing `task`'s target.
    pub fn begin_close(&mut self, task: &CloseTask) -> Action {
        let (sm, action) = CloseStateMachine::start(task);
        self.sub = Sub::Close(sm);
        action
    }

    /// Advance with the message now sitting in `payload`, tagged `type_byte`.
    pub fn step(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        if !matches!(self.sub, Sub::None) {
            return self.step_sub(type_byte, payload);
        }

        match self.state {
            State::WaitingAuth => self.handle_auth_message(type_byte, payload),
            State::SaslInProgress => self.handle_sasl_message(type_byte, payload),
            State::WaitingAuthResult => self.handle_auth_result(type_byte, payload),
            State::WaitingStartupReady => self.handle_startup_ready(type_byte, payload),
            State::Idle => self.handle_idle_message(type_byte, payload),
            State::WaitingSslResponse => Err(Error::Protocol(
                "step() called while waiting for the SSL negotiation byte".into(),
            )),
        }
    }

    fn step_sub(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        let action = match &mut self.sub {
            Sub::Query(sm) => sm.step(type_byte, payload)?,
            Sub::Prepare(sm) => sm.step(type_byte, payload)?,
            Sub::Close(sm) => sm.step(type_byte, payload)?,
            Sub::None => unreachable!("step_sub called with no sub-state machine active"),
        };
        if matches!(action, Action::FireReadyForQuery) {
            self.sub = Sub::None;
            self.state = State::Idle;
        }
        Ok(action)
    }

    fn handle_auth_message(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        if type_byte == msg_type::NEGOTIATE_PROTOCOL_VERSION {
            let negotiate = NegotiateProtocolVersion::parse(payload)?;
            return Err(Error::Protocol(format!(
                "server does not support the requested protocol minor version \
                 (newest it supports: 3.{}); unrecognized options: {:?}",
                negotiate.newest_minor_version, negotiate.unrecognized_options
            )));
        }
        if type_byte == msg_type::ERROR_RESPONSE {
            return Err(ErrorResponse::parse(payload)?.into_error());
        }
        if RawMessage::is_async_type(type_byte) {
            return handle_async(type_byte, payload);
        }
        if type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected Authentication, got '{}'",
                type_byte as char
            )));
        }

        match AuthenticationMessage::parse(payload)? {
            AuthenticationMessage::Ok => {
                self.state = State::WaitingStartupReady;
                Ok(Action::Read)
            }
            AuthenticationMessage::CleartextPassword => {
                let password = self.require_password()?;
                self.state = State::WaitingAuthResult;
                Ok(Action::SendPassword {
                    mode: AuthMode::Cleartext,
                    bytes: password.into_bytes(),
                })
            }
            AuthenticationMessage::Md5Password { salt } => {
                let password = self.require_password()?;
                let hashed = md5_password(&self.config.user, &password, &salt);
                self.state = State::WaitingAuthResult;
                Ok(Action::SendPassword {
                    mode: AuthMode::Md5,
                    bytes: hashed.into_bytes(),
                })
            }
            AuthenticationMessage::Sasl { mechanisms } => {
                if !mechanisms.contains(&"SCRAM-SHA-256") {
                    return Err(Error::Auth(format!(
                        "no supported SASL mechanism; server offers {mechanisms:?}"
                    )));
                }
                let password = self.require_password()?;
                let scram = ScramClient::new(&password);
                let client_first = scram.client_first_message();
                self.scram_client = Some(scram);
                self.state = State::SaslInProgress;
                Ok(Action::SendSaslInitial {
                    mechanism: "SCRAM-SHA-256",
                    bytes: client_first.into_bytes(),
                })
            }
            other => Err(Error::Unsupported(format!(
                "unsupported authentication method: {other:?}"
            ))),
        }
    }

    fn require_password(&self) -> Result<String> {
        self.config
            .password
            .clone()
            .ok_or_else(|| Error::Auth("password required but not provided".into()))
    }

    fn handle_sasl_message(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        if type_byte == msg_type::ERROR_RESPONSE {
            return Err(ErrorResponse::parse(payload)?.into_error());
        }
        if RawMessage::is_async_type(type_byte) {
            return handle_async(type_byte, payload);
        }
        if type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected Authentication, got '{}'",
                type_byte as char
            )));
        }

        match AuthenticationMessage::parse(payload)? {
            AuthenticationMessage::SaslContinue { data } => {
                let scram = self
                    .scram_client
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;
                let server_first = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("invalid server-first-message: {e}")))?;
                let client_final = scram
                    .process_server_first(server_first)
                    .map_err(Error::Auth)?;
                Ok(Action::SendSaslResponse(client_final.into_bytes()))
            }
            AuthenticationMessage::SaslFinal { data } => {
                let scram = self
                    .scram_client
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;
                let server_final = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("invalid server-final-message: {e}")))?;
                scram.verify_server_final(server_final).map_err(Error::Auth)?;
                self.state = State::WaitingAuthResult;
                Ok(Action::Read)
            }
            other => Err(Error::Protocol(format!("unexpected SASL message: {other:?}"))),
        }
    }

    fn handle_auth_result(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        if type_byte == msg_type::ERROR_RESPONSE {
            return Err(ErrorResponse::parse(payload)?.into_error());
        }
        if RawMessage::is_async_type(type_byte) {
            return handle_async(type_byte, payload);
        }
        if type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected AuthenticationOk, got '{}'",
                type_byte as char
            )));
        }
        match AuthenticationMessage::parse(payload)? {
            AuthenticationMessage::Ok => {
                self.state = State::WaitingStartupReady;
                Ok(Action::Read)
            }
            other => Err(Error::Auth(format!("unexpected auth result: {other:?}"))),
        }
    }

    fn handle_startup_ready(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        match type_byte {
            msg_type::BACKEND_KEY_DATA => {
                let key = BackendKeyData::parse(payload)?;
                self.backend_pid = key.process_id();
                self.backend_secret = key.secret();
                Ok(Action::Read)
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(payload)?;
                self.server_params
                    .push((param.name.to_string(), param.value.to_string()));
                Ok(Action::Read)
            }
            msg_type::ERROR_RESPONSE => Err(ErrorResponse::parse(payload)?.into_error()),
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = State::Idle;
                Ok(Action::FireReadyForStartup)
            }
            other if RawMessage::is_async_type(other) => handle_async(other, payload),
            _ => Err(Error::Protocol(format!(
                "unexpected message during startup: '{}'",
                type_byte as char
            ))),
        }
    }

    fn handle_idle_message(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        if RawMessage::is_async_type(type_byte) {
            return handle_async(type_byte, payload);
        }
        Err(Error::Protocol(format!(
            "unexpected message '{}' with no task running",
            type_byte as char
        )))
    }
}

fn handle_async(type_byte: u8, payload: &[u8]) -> Result<Action> {
    match type_byte {
        msg_type::NOTICE_RESPONSE => {
            let notice = crate::protocol::backend::NoticeResponse::parse(payload)?;
            Ok(Action::DeliverAsyncAndRead(AsyncMessage::Notice(
                notice.fields,
            )))
        }
        msg_type::PARAMETER_STATUS => {
            let param = ParameterStatus::parse(payload)?;
            Ok(Action::DeliverAsyncAndRead(AsyncMessage::ParameterChanged {
                name: param.name.to_string(),
                value: param.value.to_string(),
            }))
        }
        msg_type::NOTIFICATION_RESPONSE => {
            let notification = crate::protocol::backend::auth::NotificationResponse::parse(payload)?;
            Ok(Action::DeliverAsyncAndRead(AsyncMessage::Notification {
                pid: notification.pid,
                channel: notification.channel.to_string(),
                payload: notification.payload.to_string(),
            }))
        }
        _ => Err(Error::Protocol(format!(
            "unknown async message type '{}'",
            type_byte as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new("postgres").database("test")
    }

    #[test]
    fn startup_without_ssl_sends_startup_message() {
        let (sm, action) = ConnectionStateMachine::new(config()).unwrap();
        assert!(matches!(action, Action::SendStartup(_)));
        assert!(!sm.is_idle());
    }

    #[test]
    fn require_ssl_without_tls_feature_errors() {
        if cfg!(feature = "tls") {
            return;
        }
        let cfg = config().ssl_mode(SslMode::Require);
        assert!(ConnectionStateMachine::new(cfg).is_err());
    }

    #[test]
    fn auth_ok_then_ready_reaches_idle() {
        let (mut sm, _) = ConnectionStateMachine::new(config()).unwrap();

        let mut auth_ok = 0_i32.to_be_bytes().to_vec();
        let action = sm.step(msg_type::AUTHENTICATION, &auth_ok).unwrap();
        assert!(matches!(action, Action::Read));

        let mut rfq = Vec::new();
        rfq.push(b'I');
        let action = sm
            .step(msg_type::READY_FOR_QUERY, &rfq)
            .unwrap();
        assert!(matches!(action, Action::FireReadyForStartup));
        assert!(sm.is_idle());
        auth_ok.clear();
    }

    #[test]
    fn cleartext_password_requested_without_config_password_errors() {
        let (mut sm, _) = ConnectionStateMachine::new(config()).unwrap();
        let auth_cleartext = 3_i32.to_be_bytes();
        let err = sm
            .step(msg_type::AUTHENTICATION, &auth_cleartext)
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }
}
