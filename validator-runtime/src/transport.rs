//! Wire transports between the router and a sandbox's task handler.
//!
//! Both strategies carry exactly one JSON request and one JSON reply per
//! call. Deadlines are applied by the caller; dropping a `send` future
//! cancels the call.

use std::process::Stdio;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::TransportKind;
use crate::error::{Result, SandboxError, TaskHandlerErrorKind, TransportErrorKind};
use crate::sandbox::Endpoint;
use crate::util::http_client;

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `payload` and return the handler's decoded JSON reply.
    async fn send(&self, endpoint: &Endpoint, payload: &Value) -> Result<Value>;

    fn name(&self) -> &'static str;
}

pub fn transport_for(kind: TransportKind) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Http => Arc::new(HttpTransport),
        TransportKind::Exec => Arc::new(ExecTransport),
    }
}

fn malformed(msg: impl Into<String>) -> SandboxError {
    SandboxError::Transport(TransportErrorKind::Malformed(msg.into()))
}

fn parse_reply(body: &str) -> Result<Value> {
    serde_json::from_str(body.trim()).map_err(|err| {
        SandboxError::TaskHandler(TaskHandlerErrorKind::BadShape(format!(
            "reply is not JSON: {err}"
        )))
    })
}

/// `POST /` with a JSON body; the reply body is the verdict.
pub struct HttpTransport;

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint: &Endpoint, payload: &Value) -> Result<Value> {
        let Some(base) = endpoint.base_url() else {
            return Err(malformed(format!("http transport cannot reach {endpoint}")));
        };
        let url = format!("{base}/");
        trace!("http transport: POST {url}");

        let response = http_client()?
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|err| {
                if err.is_connect() {
                    SandboxError::Transport(TransportErrorKind::ConnectionRefused)
                } else if err.is_timeout() {
                    SandboxError::Transport(TransportErrorKind::Timeout)
                } else {
                    malformed(format!("request to {url} failed: {err}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| malformed(format!("failed to read reply body: {err}")))?;

        if !status.is_success() {
            debug!("http transport: {url} answered {status}: {body}");
            return Err(SandboxError::TaskHandler(TaskHandlerErrorKind::BadStatus(
                i64::from(status.as_u16()),
            )));
        }
        parse_reply(&body)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Spawn the handler per call: one JSON line on stdin, one JSON line back on
/// stdout. A non-zero exit status is a handler failure.
pub struct ExecTransport;

#[async_trait::async_trait]
impl Transport for ExecTransport {
    async fn send(&self, endpoint: &Endpoint, payload: &Value) -> Result<Value> {
        let Endpoint::Exec { program, args } = endpoint else {
            return Err(malformed(format!("exec transport cannot reach {endpoint}")));
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                debug!("exec transport: failed to spawn {program}: {err}");
                SandboxError::Transport(TransportErrorKind::ConnectionRefused)
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| malformed("failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| malformed("failed to capture stdout"))?;

        let mut line = serde_json::to_string(payload)
            .map_err(|err| malformed(format!("failed to encode payload: {err}")))?;
        line.push('\n');
        // A handler that exits without reading stdin shows up below as a bad status.
        if let Err(err) = stdin.write_all(line.as_bytes()).await {
            debug!("exec transport: write to {program} failed: {err}");
        }
        drop(stdin);

        let mut reader = BufReader::new(stdout);
        let mut reply = String::new();
        let read = reader
            .read_line(&mut reply)
            .await
            .map_err(|err| malformed(format!("failed to read reply: {err}")))?;

        let status = child
            .wait()
            .await
            .map_err(|err| malformed(format!("failed to wait for handler: {err}")))?;
        if !status.success() {
            return Err(SandboxError::TaskHandler(TaskHandlerErrorKind::BadStatus(
                i64::from(status.code().unwrap_or(-1)),
            )));
        }
        if read == 0 {
            return Err(malformed("handler closed stdout without replying"));
        }
        parse_reply(&reply)
    }

    fn name(&self) -> &'static str {
        "exec"
    }
}
