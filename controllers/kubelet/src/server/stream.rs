//! `exec` and `attach` over websockets.
//!
//! Frames carry a one-byte channel prefix (`v4.channel.k8s.io`). The session
//! is proxied to the host pod through the API server.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, AttachedProcess, TerminalSize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Subprotocols accepted on upgrade, most preferred first
pub const PROTOCOLS: [&str; 4] = [
    "v4.channel.k8s.io",
    "v3.channel.k8s.io",
    "v2.channel.k8s.io",
    "channel.k8s.io",
];

pub mod channel {
    pub const STDIN: u8 = 0;
    pub const STDOUT: u8 = 1;
    pub const STDERR: u8 = 2;
    pub const ERROR: u8 = 3;
    pub const RESIZE: u8 = 4;
}

const NORMAL_CLOSE: u16 = 1000;

/// Client frame after channel decoding
#[derive(Debug, PartialEq, Eq)]
pub enum ClientFrame {
    Stdin(Vec<u8>),
    Resize { width: u16, height: u16 },
}

/// Decode a binary frame sent by the client.
///
/// Resize payloads are JSON (`{"Width":80,"Height":24}`) in v4.
#[must_use]
pub fn parse_frame(data: &[u8]) -> Option<ClientFrame> {
    let (&channel, payload) = data.split_first()?;
    match channel {
        channel::STDIN => Some(ClientFrame::Stdin(payload.to_vec())),
        channel::RESIZE => {
            #[derive(serde::Deserialize)]
            #[serde(rename_all = "PascalCase")]
            struct Size {
                width: u16,
                height: u16,
            }
            let size: Size = serde_json::from_slice(payload).ok()?;
            Some(ClientFrame::Resize {
                width: size.width,
                height: size.height,
            })
        }
        other => {
            debug!(channel = other, "Ignoring frame on server-only channel");
            None
        }
    }
}

#[must_use]
pub fn frame(channel: u8, data: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(1 + data.len());
    msg.push(channel);
    msg.extend_from_slice(data);
    msg
}

/// Status document sent on the error channel when a session ends
#[must_use]
pub fn status_frame(error: Option<&str>) -> Vec<u8> {
    let status = match error {
        None => serde_json::json!({ "metadata": {}, "status": "Success" }),
        Some(message) => serde_json::json!({ "metadata": {}, "status": "Failure", "message": message }),
    };
    frame(channel::ERROR, status.to_string().as_bytes())
}

/// Parameters of an exec or attach request, read from the query string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParams {
    pub command: Vec<String>,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

fn flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "True")
}

/// Decoded `key=value` pairs; repeated keys are kept in order
#[must_use]
pub fn query_pairs(raw: &str) -> Vec<(String, String)> {
    let decode = |s: &str| {
        let s = s.replace('+', " ");
        urlencoding::decode(&s).map_or(s.clone(), |d| d.into_owned())
    };
    raw.split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode(k), decode(v)),
            None => (decode(pair), String::new()),
        })
        .collect()
}

impl SessionParams {
    #[must_use]
    pub fn from_query(raw: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in query_pairs(raw) {
            match key.as_str() {
                "command" => params.command.push(value),
                "input" | "stdin" => params.stdin = flag(&value),
                "output" | "stdout" => params.stdout = flag(&value),
                "error" | "stderr" => params.stderr = flag(&value),
                "tty" => params.tty = flag(&value),
                _ => {}
            }
        }
        params
    }

    #[must_use]
    pub fn attach_params(&self, container: &str) -> AttachParams {
        AttachParams {
            container: Some(container.to_string()),
            stdin: self.stdin,
            stdout: self.stdout,
            // A tty merges stderr into stdout
            stderr: self.stderr && !self.tty,
            tty: self.tty,
            max_stdin_buf_size: None,
            max_stdout_buf_size: None,
            max_stderr_buf_size: None,
        }
    }
}

/// Which subresource a session drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Exec,
    Attach,
}

async fn close(sender: &mut SplitSink<WebSocket, Message>, error: Option<&str>) {
    let _ = sender.send(Message::Binary(status_frame(error).into())).await;
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: NORMAL_CLOSE,
            reason: "".into(),
        })))
        .await;
}

async fn forward<R>(mut reader: R, channel: u8, tx: mpsc::Sender<(u8, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send((channel, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn start(
    pods: &Api<Pod>,
    host_name: &str,
    kind: SessionKind,
    params: &SessionParams,
    container: &str,
) -> Result<AttachedProcess, kube::Error> {
    let attach = params.attach_params(container);
    match kind {
        SessionKind::Exec => pods.exec(host_name, params.command.clone(), &attach).await,
        SessionKind::Attach => pods.attach(host_name, &attach).await,
    }
}

/// Proxy one upgraded websocket to the host pod `host_name`
pub async fn proxy(
    socket: WebSocket,
    pods: Api<Pod>,
    host_name: String,
    container: String,
    kind: SessionKind,
    params: SessionParams,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut process = match start(&pods, &host_name, kind, &params, &container).await {
        Ok(process) => process,
        Err(e) => {
            warn!(pod = %host_name, error = %e, "Failed to start session");
            close(&mut ws_tx, Some(&e.to_string())).await;
            return;
        }
    };
    info!(pod = %host_name, container = %container, kind = ?kind, "Session started");

    let (out_tx, mut out_rx) = mpsc::channel::<(u8, Vec<u8>)>(64);
    let mut readers = Vec::new();
    if let Some(stdout) = process.stdout() {
        readers.push(tokio::spawn(forward(stdout, channel::STDOUT, out_tx.clone())));
    }
    if let Some(stderr) = process.stderr() {
        readers.push(tokio::spawn(forward(stderr, channel::STDERR, out_tx.clone())));
    }
    drop(out_tx);

    let mut stdin = process.stdin();
    let mut resize = process.terminal_size();

    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Binary(data))) => match parse_frame(&data) {
                    Some(ClientFrame::Stdin(payload)) => {
                        if let Some(writer) = stdin.as_mut() {
                            if writer.write_all(&payload).await.is_err() {
                                break;
                            }
                            let _ = writer.flush().await;
                        }
                    }
                    Some(ClientFrame::Resize { width, height }) => {
                        if let Some(tx) = resize.as_mut() {
                            let _ = tx.send(TerminalSize { width, height }).await;
                        }
                    }
                    None => {}
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            output = out_rx.recv() => match output {
                Some((channel, data)) => {
                    if ws_tx.send(Message::Binary(frame(channel, &data).into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    for reader in readers {
        let _ = reader.await;
    }
    let outcome = match process.take_status() {
        Some(status) => status.await.and_then(|s| match s.status.as_deref() {
            Some("Failure") => s.message,
            _ => None,
        }),
        None => None,
    };
    close(&mut ws_tx, outcome.as_deref()).await;
    info!(pod = %host_name, "Session closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames() {
        assert_eq!(parse_frame(&frame(channel::STDIN, b"ls\n")), Some(ClientFrame::Stdin(b"ls\n".to_vec())));
        assert_eq!(
            parse_frame(&frame(channel::RESIZE, br#"{"Width":120,"Height":40}"#)),
            Some(ClientFrame::Resize { width: 120, height: 40 })
        );
        assert_eq!(parse_frame(&frame(channel::STDOUT, b"x")), None);
        assert_eq!(parse_frame(&[]), None);

        let status = status_frame(Some("exit 1"));
        assert_eq!(status[0], channel::ERROR);
        let doc: serde_json::Value = serde_json::from_slice(&status[1..]).unwrap();
        assert_eq!(doc["status"], "Failure");
    }

    #[test]
    fn test_session_params_from_query() {
        let params = SessionParams::from_query("command=sh&command=-c&command=echo%20hi+there&input=1&output=1&error=1&tty=0");
        assert_eq!(params.command, vec!["sh", "-c", "echo hi there"]);
        assert!(params.stdin && params.stdout && params.stderr && !params.tty);

        let tty = SessionParams::from_query("command=bash&stdin=true&stdout=true&stderr=true&tty=true");
        let attach = tty.attach_params("app");
        assert_eq!(attach.container.as_deref(), Some("app"));
        assert!(attach.tty);
        assert!(!attach.stderr);
    }
}
