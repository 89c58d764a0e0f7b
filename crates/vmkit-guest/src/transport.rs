//! Host-side connection establishment for the exec/file-copy channel (spec
//! §4.G). Production transport is vsock to the instance's derived channel
//! id; a Unix domain socket stands in wherever vsock devices aren't
//! available, which is every test environment and some container hosts.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_vsock::{VsockAddr, VsockStream};

use vmkit_core::error::{Error, Result};

const SUBSYSTEM: &str = "guest_channel";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a vsock connection to an instance's channel id, performing the
/// optional text handshake (`CONNECT <port>\n` / `OK …\n`) some hypervisor
/// vsock multiplexers require before frames start flowing.
pub async fn connect_vsock(cid: u32, port: u32, handshake_port: Option<u32>) -> Result<VsockStream> {
    let mut stream = VsockStream::connect(VsockAddr::new(cid, port))
        .await
        .map_err(|e| Error::dependency_unavailable(SUBSYSTEM, format!("vsock connect to cid {cid} port {port}: {e}")))?;

    if let Some(target_port) = handshake_port {
        perform_handshake(&mut stream, target_port).await?;
    }
    Ok(stream)
}

/// Connect over a Unix domain socket instead of vsock. Same handshake
/// option, for parity with `connect_vsock` in tests that stand a UDS in
/// for a guest's vsock endpoint.
pub async fn connect_uds(path: impl AsRef<Path>, handshake_port: Option<u32>) -> Result<UnixStream> {
    let mut stream = UnixStream::connect(path.as_ref())
        .await
        .map_err(|e| Error::dependency_unavailable(SUBSYSTEM, format!("uds connect to {:?}: {e}", path.as_ref())))?;

    if let Some(target_port) = handshake_port {
        perform_handshake(&mut stream, target_port).await?;
    }
    Ok(stream)
}

/// Send `CONNECT <port>\n` and require a reply line starting with `OK`.
async fn perform_handshake<S>(stream: &mut S, port: u32) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        stream.write_all(format!("CONNECT {port}\n").as_bytes()).await?;
        let mut reader = BufReader::new(&mut *stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if !line.trim_end().starts_with("OK") {
            return Err(std::io::Error::other(format!("handshake rejected: {line:?}")));
        }
        Ok::<(), std::io::Error>(())
    })
    .await
    .map_err(|_| Error::timeout(SUBSYSTEM, "host-guest channel handshake timed out"))?
    .map_err(|e| Error::dependency_unavailable(SUBSYSTEM, format!("handshake failed: {e}")))
}
