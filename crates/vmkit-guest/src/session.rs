//! Exec session protocol: the JSON envelopes exchanged over stdin/resize/exit
//! frames, and the full-duplex driver that multiplexes them (spec §4.G).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, split};
use tokio::sync::{mpsc, oneshot};

use vmkit_core::error::{Error, Result};

use crate::frame::{StreamId, read_frame, write_frame};

const SUBSYSTEM: &str = "guest_channel";

/// First stdin frame of a session: the command to run and whether a pty is
/// allocated (stdout/stderr are combined on stdout when true).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub tty: bool,
}

/// Resize-channel frame payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResizeMessage {
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i32,
}

/// Terminal frame on stream 3: normal termination carries an exit code,
/// abnormal termination carries a free-form message instead.
#[derive(Debug, Clone)]
pub enum ExitEnvelope {
    Exited(ExitStatus),
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExitJson {
    status: Option<ExitStatus>,
}

impl ExitEnvelope {
    fn parse(payload: &[u8]) -> Self {
        match serde_json::from_slice::<ExitJson>(payload) {
            Ok(ExitJson { status: Some(status) }) => Self::Exited(status),
            _ => Self::Error(String::from_utf8_lossy(payload).into_owned()),
        }
    }
}

/// Drives one exec session to completion: sends the initial request frame,
/// forwards stdin/resize frames from the host side, and demultiplexes
/// stdout/stderr frames to the caller until the guest's terminator frame
/// arrives, the socket closes, or `cancel` fires — whichever comes first.
pub async fn run_exec_session<S>(
    socket: S,
    request: ExecRequest,
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
    mut resize_rx: mpsc::Receiver<ResizeMessage>,
    stdout_tx: mpsc::Sender<Vec<u8>>,
    stderr_tx: mpsc::Sender<Vec<u8>>,
    mut cancel: oneshot::Receiver<()>,
) -> Result<ExitEnvelope>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = split(socket);

    let initial = serde_json::to_vec(&request)?;
    write_frame(&mut writer, StreamId::Stdin, &initial).await?;

    let writer_task = tokio::spawn(async move {
        let mut stdin_open = true;
        let mut resize_open = true;
        while stdin_open || resize_open {
            tokio::select! {
                chunk = stdin_rx.recv(), if stdin_open => {
                    match chunk {
                        Some(bytes) => write_frame(&mut writer, StreamId::Stdin, &bytes).await?,
                        None => stdin_open = false,
                    }
                }
                resize = resize_rx.recv(), if resize_open => {
                    match resize {
                        Some(msg) => {
                            let payload = serde_json::to_vec(&msg)?;
                            write_frame(&mut writer, StreamId::Resize, &payload).await?;
                        }
                        None => resize_open = false,
                    }
                }
            }
        }
        Result::<()>::Ok(())
    });

    let reader_task = tokio::spawn(async move {
        loop {
            let (stream, payload) = read_frame(&mut reader).await?;
            match stream {
                StreamId::Stdout => {
                    let _ = stdout_tx.send(payload).await;
                }
                StreamId::Stderr => {
                    let _ = stderr_tx.send(payload).await;
                }
                StreamId::ErrorOrExit => return Ok(ExitEnvelope::parse(&payload)),
                StreamId::Stdin | StreamId::Resize => {
                    return Err(Error::internal(SUBSYSTEM, "guest sent a host-bound stream id"));
                }
            }
        }
    });

    let result: Result<ExitEnvelope> = tokio::select! {
        r = reader_task => r
            .map_err(|e| Error::internal(SUBSYSTEM, e.to_string()))
            .and_then(|inner| inner),
        _ = &mut cancel => Err(Error::cancelled(SUBSYSTEM, "exec session cancelled")),
    };

    writer_task.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_envelope_parses_normal_termination() {
        let env = ExitEnvelope::parse(br#"{"status":{"code":0}}"#);
        match env {
            ExitEnvelope::Exited(s) => assert_eq!(s.code, 0),
            ExitEnvelope::Error(_) => panic!("expected Exited"),
        }
    }

    #[test]
    fn exit_envelope_falls_back_to_error_text() {
        let env = ExitEnvelope::parse(b"guest agent panicked");
        match env {
            ExitEnvelope::Error(msg) => assert_eq!(msg, "guest agent panicked"),
            ExitEnvelope::Exited(_) => panic!("expected Error"),
        }
    }

    #[tokio::test]
    async fn full_session_round_trip_over_duplex() {
        let (client, mut server) = tokio::io::duplex(4096);

        let (stdin_tx, stdin_rx) = mpsc::channel(8);
        let (resize_tx, resize_rx) = mpsc::channel(8);
        let (stdout_tx, mut stdout_rx) = mpsc::channel(8);
        let (stderr_tx, _stderr_rx) = mpsc::channel(8);
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        drop(resize_tx);
        drop(stdin_tx);

        let session = tokio::spawn(run_exec_session(
            client,
            ExecRequest { command: vec!["/bin/sh".into(), "-c".into(), "whoami".into()], tty: false },
            stdin_rx,
            resize_rx,
            stdout_tx,
            stderr_tx,
            cancel_rx,
        ));

        // Act as the guest: consume the initial stdin frame, then reply.
        let (stream, payload) = read_frame(&mut server).await.unwrap();
        assert_eq!(stream, StreamId::Stdin);
        let req: ExecRequest = serde_json::from_slice(&payload).unwrap();
        assert_eq!(req.command, vec!["/bin/sh", "-c", "whoami"]);

        write_frame(&mut server, StreamId::Stdout, b"root\n").await.unwrap();
        write_frame(&mut server, StreamId::ErrorOrExit, br#"{"status":{"code":0}}"#)
            .await
            .unwrap();

        let outcome = session.await.unwrap().unwrap();
        match outcome {
            ExitEnvelope::Exited(s) => assert_eq!(s.code, 0),
            ExitEnvelope::Error(_) => panic!("expected clean exit"),
        }
        assert_eq!(stdout_rx.recv().await.unwrap(), b"root\n");
    }
}
