/// Client-side outbound dial: open a TCP connection to the remote
/// server, hand it a fresh random key, and perform the handshake so the
/// caller gets back a `FramedConn` ready to carry one proxied connection's
/// bytes.
use daze_proto::protocol::{build_handshake_payload, FramedConn, KEY_LEN};
use rand::RngCore;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Dial `server_addr` and request a tunnel to `target` (already in
/// `host:port` form). Each call generates its own random key — sessions
/// never share keystream state.
pub async fn dial(server_addr: SocketAddr, target: &str) -> io::Result<FramedConn<TcpStream>> {
    let mut raw = TcpStream::connect(server_addr).await?;

    let mut key = vec![0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    tokio::io::AsyncWriteExt::write_all(&mut raw, &key).await?;

    let mut framed = FramedConn::new(raw, &key)?;
    let payload = build_handshake_payload(target)?;
    framed.send(&payload).await?;

    Ok(framed)
}
