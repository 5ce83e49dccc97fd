//! Client side of the control socket, used by admin tooling and tests

use chrono::{DateTime, Local, NaiveDate};
use rollcall_api::{
    AbsenceKind, AlertChoice, Command, Event, Request, Response, ResponsePayload, ResponseResult,
    ServiceStateSnapshot, StudentView,
};
use rollcall_util::{AlertId, StudentId};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

use crate::{IpcError, IpcResult};

pub struct IpcClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_request_id: u64,
}

impl IpcClient {
    pub async fn connect(socket_path: impl AsRef<Path>) -> IpcResult<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
            next_request_id: 1,
        })
    }

    /// Send a command and wait for its response.
    ///
    /// Events that arrive first (the connection may already be subscribed)
    /// are skipped.
    pub async fn send(&mut self, command: Command) -> IpcResult<Response> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let mut line = serde_json::to_string(&Request::new(request_id, command))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        loop {
            let line = self.lines.next_line().await?.ok_or(IpcError::ConnectionClosed)?;
            match serde_json::from_str::<Response>(&line) {
                Ok(response) if response.request_id == request_id => return Ok(response),
                Ok(response) => {
                    return Err(IpcError::UnexpectedResponse {
                        expected: request_id,
                        got: response.request_id,
                    })
                }
                Err(e) => {
                    // Anything that is not a response must be an event
                    serde_json::from_str::<Event>(&line).map_err(|_| e)?;
                    debug!("Skipping event while awaiting response");
                }
            }
        }
    }

    /// Send a command and return its payload, turning error responses into
    /// [`IpcError::Rejected`]
    pub async fn call(&mut self, command: Command) -> IpcResult<ResponsePayload> {
        match self.send(command).await?.result {
            ResponseResult::Ok(payload) => Ok(payload),
            ResponseResult::Err(e) => Err(IpcError::Rejected {
                code: e.code,
                message: e.message,
            }),
        }
    }

    pub async fn state(&mut self) -> IpcResult<ServiceStateSnapshot> {
        match self.call(Command::GetState).await? {
            ResponsePayload::State(snapshot) => Ok(snapshot),
            other => Err(unexpected_payload(other)),
        }
    }

    /// Forward a button press from the notification platform
    pub async fn respond(&mut self, alert_id: AlertId, choice: AlertChoice) -> IpcResult<()> {
        match self.call(Command::RespondToAlert { alert_id, choice }).await? {
            ResponsePayload::ResponseAccepted => Ok(()),
            other => Err(unexpected_payload(other)),
        }
    }

    pub async fn set_status(
        &mut self,
        student_id: StudentId,
        kind: AbsenceKind,
        start: Option<DateTime<Local>>,
        end: Option<NaiveDate>,
        reason: Option<String>,
    ) -> IpcResult<StudentView> {
        let command = Command::SetStatus {
            student_id,
            kind,
            start,
            end,
            reason,
        };
        match self.call(command).await? {
            ResponsePayload::StatusUpdated(view) => Ok(view),
            other => Err(unexpected_payload(other)),
        }
    }

    /// Subscribe and turn this connection into an event stream
    pub async fn subscribe(mut self) -> IpcResult<EventStream> {
        match self.call(Command::SubscribeEvents).await? {
            ResponsePayload::Subscribed { .. } => Ok(EventStream { lines: self.lines }),
            other => Err(unexpected_payload(other)),
        }
    }
}

fn unexpected_payload(payload: ResponsePayload) -> IpcError {
    IpcError::UnexpectedPayload(format!("{payload:?}"))
}

pub struct EventStream {
    lines: Lines<BufReader<OwnedReadHalf>>,
}

impl EventStream {
    pub async fn next(&mut self) -> IpcResult<Event> {
        let line = self.lines.next_line().await?.ok_or(IpcError::ConnectionClosed)?;
        Ok(serde_json::from_str(&line)?)
    }
}
