//! File-copy protocol: a one-shot JSON-over-the-same-channel exchange,
//! distinct from the exec session (spec §4.G). A request names a direction
//! and path; the response is either a single `stat` record or a
//! `header → data* → end` stream.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use vmkit_core::error::{Error, Result};

const SUBSYSTEM: &str = "guest_channel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyDirection {
    To,
    From,
    Stat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyRequest {
    pub direction: CopyDirection,
    pub path: String,
    #[serde(default)]
    pub is_dir: bool,
    pub mode: u32,
    #[serde(default)]
    pub follow_links: bool,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatResponse {
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub is_dir: bool,
}

/// Announces one entry of a directory copy before its data frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyHeader {
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyData {
    pub bytes: Vec<u8>,
}

/// Terminates a copy session. A stream without a `final: true` marker is a
/// failed transfer — the caller must surface *Cancelled* or *Internal*.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyEnd {
    #[serde(rename = "final")]
    pub is_final: bool,
    pub error: Option<String>,
}

/// One message of the file-copy protocol, newline-delimited JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CopyMessage {
    Request(CopyRequest),
    Stat(StatResponse),
    Header(CopyHeader),
    Data(CopyData),
    End(CopyEnd),
}

/// Write one newline-delimited JSON message.
pub async fn send_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &CopyMessage) -> Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one newline-delimited JSON message.
pub async fn recv_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<CopyMessage> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if line.is_empty() {
                return Err(Error::not_found(SUBSYSTEM, "copy stream closed before a message"));
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    serde_json::from_slice(&line).map_err(Error::from)
}

/// Consume the `header → data* → end` stream for one directory copy,
/// handing each data chunk to `on_chunk`. Returns an error if the stream
/// ends without `final=true`.
pub async fn drain_copy_stream<R, F>(reader: &mut R, mut on_chunk: F) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&CopyHeader, &[u8]),
{
    let mut current_header: Option<CopyHeader> = None;
    loop {
        match recv_message(reader).await? {
            CopyMessage::Header(h) => current_header = Some(h),
            CopyMessage::Data(d) => {
                let header = current_header
                    .as_ref()
                    .ok_or_else(|| Error::invalid_input(SUBSYSTEM, "data frame before header"))?;
                on_chunk(header, &d.bytes);
            }
            CopyMessage::End(end) => {
                if !end.is_final {
                    return Err(Error::internal(
                        SUBSYSTEM,
                        end.error.unwrap_or_else(|| "copy stream ended without final marker".into()),
                    ));
                }
                return Ok(());
            }
            CopyMessage::Request(_) | CopyMessage::Stat(_) => {
                return Err(Error::invalid_input(SUBSYSTEM, "unexpected message in copy data stream"));
            }
        }
    }
}
