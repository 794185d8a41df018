/// Server-side session protocol: read the raw key, complete the
/// handshake, dial the requested target, then splice.
use daze_proto::protocol::{parse_auth_frame, parse_dest_frame, FramedConn, AUTH_FRAME_LEN, DEST_FRAME_LEN, KEY_LEN};
use daze_proto::splice;
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

/// Handle a single accepted connection end-to-end. The handshake (key,
/// auth frame, destination frame) must complete within `handshake_timeout`;
/// once dialing the target begins there is no further deadline — the
/// session runs until either side closes.
pub async fn handle_client(
    mut raw: TcpStream,
    client_addr: SocketAddr,
    handshake_timeout: Duration,
) -> io::Result<()> {
    let mut key = vec![0u8; KEY_LEN];
    timeout(handshake_timeout, raw.read_exact(&mut key))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timeout"))??;

    let mut framed = FramedConn::new(raw, &key)?;

    let auth_frame = timeout(handshake_timeout, framed.recv_exact(AUTH_FRAME_LEN))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timeout"))??;
    parse_auth_frame(&auth_frame)?;

    let dest_frame = timeout(handshake_timeout, framed.recv_exact(DEST_FRAME_LEN))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timeout"))??;
    let (host, port) = parse_dest_frame(&dest_frame)?;

    tracing::info!("{} -> {}:{}", client_addr, host, port);

    let target = TcpStream::connect((host.as_str(), port)).await?;

    splice::splice(framed, target).await
}
