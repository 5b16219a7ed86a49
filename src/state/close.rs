//! Close sub-state machine: Close + Sync against a statement or portal.
//!
//! The server replies with `CloseComplete` before the closing `ReadyForQuery`
//! — but only if the target existed; closing an unknown name is also
//! accepted, so this machine tolerates `CloseComplete` as optional and simply
//! waits for `ReadyForQuery` either way.

use crate::error::{Error, Result};
use crate::protocol::backend::{CloseComplete, ErrorResponse, RawMessage, ReadyForQuery, msg_type};
use crate::protocol::frontend::{write_close_portal, write_close_statement, write_sync};
use crate::task::{CloseTarget, CloseTask};

use super::action::{Action, AsyncMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingReadyForQuery,
    Done,
}

/// Runs one `CloseTask` to completion.
pub struct CloseStateMachine {
    state: State,
    failed: Option<Error>,
}

impl CloseStateMachine {
    /// Build the wire bytes for `task` and the sub-state machine driving its
    /// responses.
    pub fn start(task: &CloseTask) -> (Self, Action) {
        let mut buf = Vec::new();
        match &task.target {
            CloseTarget::Statement(name) => write_close_statement(&mut buf, name),
            CloseTarget::Portal(name) => write_close_portal(&mut buf, name),
        }
        write_sync(&mut buf);

        (
            Self {
                state: State::WaitingReadyForQuery,
                failed: None,
            },
            Action::SendCloseSync(buf),
        )
    }

    /// Whether the round trip has reached `ReadyForQuery`.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Advance with the message now sitting in `buffer_set`.
    pub fn step(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        if RawMessage::is_async_type(type_byte) {
            return handle_async(type_byte, payload);
        }

        match type_byte {
            msg_type::CLOSE_COMPLETE => {
                CloseComplete::parse(payload)?;
                Ok(Action::Read)
            }
            msg_type::ERROR_RESPONSE => {
                let error = ErrorResponse::parse(payload)?;
                self.failed = Some(error.into_error());
                Ok(Action::Read)
            }
            msg_type::READY_FOR_QUERY => {
                ReadyForQuery::parse(payload)?;
                self.state = State::Done;
                match self.failed.take() {
                    Some(err) => Ok(Action::FailClose(err)),
                    None => Ok(Action::SucceedClose),
                }
            }
            _ => Err(Error::Protocol(format!(
                "expected CloseComplete or ReadyForQuery, got '{}'",
                type_byte as char
            ))),
        }
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
            let param = crate::protocol::backend::ParameterStatus::parse(payload)?;
            Ok(Action::DeliverAsyncAndRead(AsyncMessage::ParameterChanged {
                name: param.name.to_string(),
                value: param.value.to_string(),
            }))
        }
        msg_type::NOTIFICATION_RESPONSE => {
            let notification =
                crate::protocol::backend::auth::NotificationResponse::parse(payload)?;
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

    #[test]
    fn close_statement_then_ready_succeeds() {
        let task = CloseTask {
            target: CloseTarget::Statement("s1".into()),
            sink: crate::row_stream::first_sink().0,
        };
        let (mut sm, action) = CloseStateMachine::start(&task);
        assert!(matches!(action, Action::SendCloseSync(_)));

        let action = sm.step(msg_type::CLOSE_COMPLETE, &[]).unwrap();
        assert!(matches!(action, Action::Read));
        assert!(!sm.is_done());

        let mut rfq_payload = Vec::new();
        rfq_payload.push(b'I');
        let action = sm.step(msg_type::READY_FOR_QUERY, &rfq_payload).unwrap();
        assert!(matches!(action, Action::SucceedClose));
        assert!(sm.is_done());
    }
}
