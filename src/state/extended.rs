//! Extended-query sub-state machine: one Parse?/Bind/Describe/Execute/Sync
//! round trip, streaming decoded rows to the caller as they arrive.
//!
//! A statement prepared earlier skips straight to Bind; an unnamed, raw-SQL
//! query is preceded by a Parse. Either way the whole sequence (plus the
//! closing Sync) is written in a single shot, and `step` is driven purely by
//! what comes back on the wire until `ReadyForQuery`.

use crate::error::{Error, Result};
use crate::protocol::backend::{
    BindComplete, CommandComplete, DataRow, EmptyQueryResponse, ErrorResponse, NoData,
    ParseComplete, PortalSuspended, RawMessage, ReadyForQuery, RowDescription, msg_type,
};
use crate::protocol::frontend::{
    write_bind_encoded, write_describe_portal, write_execute, write_parse, write_sync,
};
use crate::protocol::types::FormatCode;
use crate::row::{ColumnDescriptor, Row};
use crate::task::{ExtendedQueryTask, QuerySource};

use super::action::{Action, AsyncMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingParse,
    WaitingBindComplete,
    WaitingDescribeResult,
    /// `Describe` reported `NoData`: no `SucceedQuery` has been sent yet, so
    /// the command tag from `CommandComplete` settles the task's `first`
    /// sink directly instead of going through the row stream.
    AwaitingNoRowsComplete,
    ProcessingRows,
    WaitingReadyForQuery,
    Done,
}

/// Runs one `ExtendedQueryTask` to completion.
pub struct QueryStateMachine {
    state: State,
    /// Result columns, known once `RowDescription`/`NoData` is seen. Held so
    /// row decoding can look up each column's type OID.
    columns: Vec<ColumnDescriptor>,
}

impl QueryStateMachine {
    /// Build the wire bytes for `task` and the sub-state machine that will
    /// drive its responses. Returns the action the driving loop should
    /// perform first: write these bytes, then read a message.
    pub fn start(task: &ExtendedQueryTask) -> (Self, Action) {
        let needs_parse = matches!(task.statement, QuerySource::Sql(_));
        let statement_name = match &task.statement {
            QuerySource::Sql(_) => "",
            QuerySource::Prepared(name) => name.as_str(),
        };

        let mut buf = Vec::new();
        if let QuerySource::Sql(sql) = &task.statement {
            write_parse(&mut buf, "", sql, &[]);
        }
        write_bind_encoded(
            &mut buf,
            "",
            statement_name,
            task.param_count,
            &task.encoded_params,
            &[FormatCode::Binary],
        );
        write_describe_portal(&mut buf, "");
        write_execute(&mut buf, "", 0);
        write_sync(&mut buf);

        let state = if needs_parse {
            State::WaitingParse
        } else {
            State::WaitingBindComplete
        };
        let action = if needs_parse {
            Action::SendParseBindDescribeExecuteSync(buf)
        } else {
            Action::SendBindDescribeExecuteSync(buf)
        };

        (
            Self {
                state,
                columns: Vec::new(),
            },
            action,
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

        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(payload)?;
            self.state = State::WaitingReadyForQuery;
            return Ok(Action::FailQuery(error.into_error()));
        }

        match self.state {
            State::WaitingParse => {
                if type_byte != msg_type::PARSE_COMPLETE {
                    return Err(unexpected("ParseComplete", type_byte));
                }
                ParseComplete::parse(payload)?;
                self.state = State::WaitingBindComplete;
                Ok(Action::Read)
            }
            State::WaitingBindComplete => {
                if type_byte != msg_type::BIND_COMPLETE {
                    return Err(unexpected("BindComplete", type_byte));
                }
                BindComplete::parse(payload)?;
                self.state = State::WaitingDescribeResult;
                Ok(Action::Read)
            }
            State::WaitingDescribeResult => match type_byte {
                msg_type::ROW_DESCRIPTION => {
                    let desc = RowDescription::parse(payload)?;
                    self.columns = desc
                        .iter()
                        .map(|field| ColumnDescriptor {
                            name: field.name.to_string(),
                            type_oid: field.type_oid(),
                            format: FormatCode::Binary,
                        })
                        .collect();
                    self.state = State::ProcessingRows;
                    Ok(Action::SucceedQuery(self.columns.clone()))
                }
                msg_type::NO_DATA => {
                    NoData::parse(payload)?;
                    self.state = State::AwaitingNoRowsComplete;
                    Ok(Action::Read)
                }
                _ => Err(unexpected("RowDescription or NoData", type_byte)),
            },
            State::AwaitingNoRowsComplete => match type_byte {
                msg_type::COMMAND_COMPLETE => {
                    let complete = CommandComplete::parse(payload)?;
                    self.state = State::WaitingReadyForQuery;
                    Ok(Action::SucceedQueryNoRows(complete.tag.to_string()))
                }
                msg_type::EMPTY_QUERY_RESPONSE => {
                    EmptyQueryResponse::parse(payload)?;
                    self.state = State::WaitingReadyForQuery;
                    Ok(Action::SucceedQueryNoRows(String::new()))
                }
                _ => Err(unexpected("CommandComplete or EmptyQueryResponse", type_byte)),
            },
            State::ProcessingRows => match type_byte {
                msg_type::DATA_ROW => {
                    let data_row = DataRow::parse(payload)?;
                    let row = Row {
                        columns: data_row.iter().map(|v| v.map(<[u8]>::to_vec)).collect(),
                    };
                    Ok(Action::ForwardRows(vec![row]))
                }
                msg_type::COMMAND_COMPLETE => {
                    let complete = CommandComplete::parse(payload)?;
                    self.state = State::WaitingReadyForQuery;
                    Ok(Action::ForwardStreamComplete(complete.tag.to_string()))
                }
                msg_type::EMPTY_QUERY_RESPONSE => {
                    EmptyQueryResponse::parse(payload)?;
                    self.state = State::WaitingReadyForQuery;
                    Ok(Action::ForwardStreamComplete(String::new()))
                }
                msg_type::PORTAL_SUSPENDED => {
                    PortalSuspended::parse(payload)?;
                    self.state = State::WaitingReadyForQuery;
                    Ok(Action::ForwardStreamComplete(String::new()))
                }
                _ => Err(unexpected("a row or command completion", type_byte)),
            },
            State::WaitingReadyForQuery => {
                if type_byte != msg_type::READY_FOR_QUERY {
                    return Err(unexpected("ReadyForQuery", type_byte));
                }
                ReadyForQuery::parse(payload)?;
                self.state = State::Done;
                Ok(Action::FireReadyForQuery)
            }
            State::Done => Err(Error::Protocol(
                "query sub-state machine stepped after completion".into(),
            )),
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

fn unexpected(expected: &str, got: u8) -> Error {
    Error::Protocol(format!("expected {expected}, got '{}'", got as char))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrepareState {
    WaitingParse,
    WaitingParamDesc,
    WaitingDescribeResult,
    WaitingReadyForQuery,
    Done,
}

/// Runs one `PrepareTask` to completion: Parse + Describe(statement) + Sync.
pub struct PrepareStateMachine {
    state: PrepareState,
    param_oids: Vec<crate::protocol::types::Oid>,
    columns: Vec<ColumnDescriptor>,
}

impl PrepareStateMachine {
    /// Build the wire bytes for `task`, named `wire_name` on the wire, and
    /// the sub-state machine driving its responses.
    pub fn start(task: &crate::task::PrepareTask, wire_name: &str) -> (Self, Action) {
        use crate::protocol::frontend::{write_describe_statement, write_parse, write_sync};

        let mut buf = Vec::new();
        write_parse(&mut buf, wire_name, &task.sql, &task.param_oids);
        write_describe_statement(&mut buf, wire_name);
        write_sync(&mut buf);

        (
            Self {
                state: PrepareState::WaitingParse,
                param_oids: Vec::new(),
                columns: Vec::new(),
            },
            Action::SendParseDescribeSync(buf),
        )
    }

    /// Whether the round trip has reached `ReadyForQuery`.
    pub fn is_done(&self) -> bool {
        self.state == PrepareState::Done
    }

    /// Advance with the message now sitting in `buffer_set`.
    pub fn step(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        use crate::protocol::backend::ParameterDescription;

        if RawMessage::is_async_type(type_byte) {
            return handle_async(type_byte, payload);
        }

        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(payload)?;
            self.state = PrepareState::WaitingReadyForQuery;
            return Ok(Action::FailPrepare(error.into_error()));
        }

        match self.state {
            PrepareState::WaitingParse => {
                if type_byte != msg_type::PARSE_COMPLETE {
                    return Err(unexpected("ParseComplete", type_byte));
                }
                ParseComplete::parse(payload)?;
                self.state = PrepareState::WaitingParamDesc;
                Ok(Action::Read)
            }
            PrepareState::WaitingParamDesc => {
                if type_byte != msg_type::PARAMETER_DESCRIPTION {
                    return Err(unexpected("ParameterDescription", type_byte));
                }
                let desc = ParameterDescription::parse(payload)?;
                self.param_oids = desc.oids().to_vec();
                self.state = PrepareState::WaitingDescribeResult;
                Ok(Action::Read)
            }
            PrepareState::WaitingDescribeResult => match type_byte {
                msg_type::ROW_DESCRIPTION => {
                    let desc = RowDescription::parse(payload)?;
                    self.columns = desc
                        .iter()
                        .map(|field| ColumnDescriptor {
                            name: field.name.to_string(),
                            type_oid: field.type_oid(),
                            format: FormatCode::Binary,
                        })
                        .collect();
                    self.state = PrepareState::WaitingReadyForQuery;
                    Ok(Action::Read)
                }
                msg_type::NO_DATA => {
                    NoData::parse(payload)?;
                    self.state = PrepareState::WaitingReadyForQuery;
                    Ok(Action::Read)
                }
                _ => Err(unexpected("RowDescription or NoData", type_byte)),
            },
            PrepareState::WaitingReadyForQuery => {
                if type_byte != msg_type::READY_FOR_QUERY {
                    return Err(unexpected("ReadyForQuery", type_byte));
                }
                ReadyForQuery::parse(payload)?;
                self.state = PrepareState::Done;
                Ok(Action::SucceedPrepare(crate::task::StatementDescription {
                    param_oids: std::mem::take(&mut self.param_oids),
                    columns: std::mem::take(&mut self.columns),
                }))
            }
            PrepareState::Done => Err(Error::Protocol(
                "prepare sub-state machine stepped after completion".into(),
            )),
        }
    }
}
