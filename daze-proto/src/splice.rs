/// Splice: join a FramedConn (obfuscated) and a plain TcpStream (the target
/// or the local application socket) into one bidirectional relay.
///
/// Two copy loops run concurrently, one per direction, each in 32 KiB
/// chunks. Whichever terminates first (EOF or error) wins the race; the
/// loser is simply dropped, which drops its half of each socket and closes
/// it — unblocking any peer still reading. The function returns once both
/// directions have stopped.
use crate::protocol::FramedConn;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// 32 KiB, per the copy-loop chunk size the spec calls for.
const CHUNK: usize = 32 * 1024;

/// Splice `framed` (the obfuscated side) with `plain` (the plaintext side).
///
/// On the server this joins the client's FramedConn with the outbound
/// socket to the real destination. On the client this joins the dialer's
/// FramedConn to the server with the local SOCKS5 application socket.
pub async fn splice(framed: FramedConn<TcpStream>, plain: TcpStream) -> io::Result<()> {
    let (mut framed_reader, mut framed_writer) = framed.into_split();
    let (mut plain_reader, mut plain_writer) = plain.into_split();

    // framed → plain: deobfuscate bytes arriving from the tunnel, write them
    // raw to the plaintext side.
    let from_tunnel = async move {
        loop {
            let data = framed_reader.recv(CHUNK).await?;
            if data.is_empty() {
                break;
            }
            plain_writer.write_all(&data).await?;
        }
        io::Result::Ok(())
    };

    // plain → framed: read raw bytes from the plaintext side, obfuscate and
    // write them to the tunnel.
    let to_tunnel = async move {
        let mut buf = vec![0u8; CHUNK];
        loop {
            let n = plain_reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            framed_writer.send(&buf[..n]).await?;
        }
        io::Result::Ok(())
    };

    tokio::select! {
        result = from_tunnel => result,
        result = to_tunnel => result,
    }
}
