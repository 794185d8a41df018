/// SOCKS5 ingress: RFC 1928, CONNECT-only, no-auth. Once a destination is
/// known we ask the router whether it should go DIRECT or TUNNELED and
/// splice accordingly.
use crate::dialer;
use crate::routing::{Decision, Router};
use daze_proto::splice;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Handle one accepted SOCKS5 client. `server_addr` is the remote daze
/// server to tunnel through when the router decides this destination
/// should not go direct.
pub async fn handle(
    mut stream: TcpStream,
    router: Arc<Router>,
    server_addr: SocketAddr,
) -> io::Result<()> {
    negotiate_method(&mut stream).await?;
    let (host, port) = match read_request(&mut stream).await {
        Ok(addr) => addr,
        Err(e) => {
            send_reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await.ok();
            return Err(e);
        }
    };

    let target = format!("{host}:{port}");
    let decision = router.classify(&host).await;
    tracing::debug!(target = %target, decision = ?decision, "routed");

    // The reply byte has to reflect whether the upstream leg actually
    // connected, so it must be established before we can answer the client.
    let upstream = match decision {
        Decision::Direct => Upstream::Plain(TcpStream::connect(&target).await),
        Decision::Tunneled => Upstream::Tunneled(dialer::dial(server_addr, &target).await),
        Decision::TryDirectElseTunneled => match TcpStream::connect(&target).await {
            Ok(plain) => Upstream::Plain(Ok(plain)),
            Err(_) => Upstream::Tunneled(dialer::dial(server_addr, &target).await),
        },
    };

    match upstream {
        Upstream::Plain(Ok(plain)) => {
            send_reply(&mut stream, REPLY_SUCCESS).await?;
            splice_plain(stream, plain).await
        }
        Upstream::Tunneled(Ok(framed)) => {
            send_reply(&mut stream, REPLY_SUCCESS).await?;
            splice::splice(framed, stream).await
        }
        Upstream::Plain(Err(e)) | Upstream::Tunneled(Err(e)) => {
            tracing::warn!(target = %target, error = %e, "upstream connect failed");
            send_reply(&mut stream, REPLY_GENERAL_FAILURE).await.ok();
            Err(e)
        }
    }
}

enum Upstream {
    Plain(io::Result<TcpStream>),
    Tunneled(io::Result<daze_proto::protocol::FramedConn<TcpStream>>),
}

async fn negotiate_method(stream: &mut TcpStream) -> io::Result<()> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(bad_request("unsupported SOCKS version"));
    }
    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(bad_request("client offered no acceptable auth method"));
    }

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

async fn read_request(stream: &mut TcpStream) -> io::Result<(String, u16)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let (version, cmd, _rsv, atyp) = (header[0], header[1], header[2], header[3]);

    if version != SOCKS_VERSION {
        return Err(bad_request("unsupported SOCKS version"));
    }
    if cmd != CMD_CONNECT {
        return Err(bad_request("only CONNECT is supported"));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            std::net::Ipv4Addr::from(buf).to_string()
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await?;
            std::net::Ipv6Addr::from(buf).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize];
            stream.read_exact(&mut buf).await?;
            String::from_utf8(buf).map_err(|_| bad_request("domain is not valid UTF-8"))?
        }
        _ => return Err(bad_request("unsupported address type")),
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    Ok((host, port))
}

async fn send_reply(stream: &mut TcpStream, reply: u8) -> io::Result<()> {
    // BND.ADDR/BND.PORT are unused by CONNECT-only clients; send zeroes.
    let frame = [
        SOCKS_VERSION,
        reply,
        0x00,
        ATYP_IPV4,
        0, 0, 0, 0,
        0, 0,
    ];
    stream.write_all(&frame).await
}

/// Bidirectional relay for two plain TCP streams (direct, non-tunneled
/// connections never touch the keystream).
async fn splice_plain(mut a: TcpStream, mut b: TcpStream) -> io::Result<()> {
    let (mut ar, mut aw) = a.split();
    let (mut br, mut bw) = b.split();

    let client_to_upstream = tokio::io::copy(&mut ar, &mut bw);
    let upstream_to_client = tokio::io::copy(&mut br, &mut aw);

    tokio::select! {
        result = client_to_upstream => result.map(|_| ()),
        result = upstream_to_client => result.map(|_| ()),
    }
}

fn bad_request(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_negotiate_rejects_non_v5() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            negotiate_method(&mut stream).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        let result = server_task.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_negotiate_accepts_no_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            negotiate_method(&mut stream).await.unwrap();
            stream
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        server_task.await.unwrap();
        assert_eq!(reply, [SOCKS_VERSION, METHOD_NO_AUTH]);
    }

    #[tokio::test]
    async fn test_read_request_parses_domain_atyp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let domain = b"example.com";
        let mut req = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, domain.len() as u8];
        req.extend_from_slice(domain);
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let (host, port) = server_task.await.unwrap().unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn test_read_request_parses_ipv4_atyp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut req = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4];
        req.extend_from_slice(&[93, 184, 216, 34]);
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let (host, port) = server_task.await.unwrap().unwrap();
        assert_eq!(host, "93.184.216.34");
        assert_eq!(port, 80);
    }

    #[tokio::test]
    async fn test_connect_to_literal_ipv4_dials_and_replies_success() {
        // Greeting + CONNECT to 127.0.0.1:<port> must dial that address and
        // reply with leading bytes 05 00.
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target_listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = target_listener.accept().await;
        });

        let router = Arc::new(Router::from_registry_text("", "CN"));
        let ingress = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ingress_addr = ingress.local_addr().unwrap();
        let server_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        tokio::spawn(async move {
            let (stream, _) = ingress.accept().await.unwrap();
            handle(stream, router, server_addr).await
        });

        let mut client = TcpStream::connect(ingress_addr).await.unwrap();
        client.write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH]).await.unwrap();
        let mut greeting_reply = [0u8; 2];
        client.read_exact(&mut greeting_reply).await.unwrap();

        let mut req = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4];
        req.extend_from_slice(&[127, 0, 0, 1]);
        req.extend_from_slice(&target_port.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..2], &[SOCKS_VERSION, REPLY_SUCCESS]);
    }

    #[tokio::test]
    async fn test_direct_dial_failure_replies_before_closing() {
        // No listener bound on this port: the direct dial must fail, and the
        // client must see a failure reply rather than a silently dropped
        // connection with a stale success byte.
        let router = Arc::new(Router::from_registry_text("", "CN"));
        let ingress = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ingress_addr = ingress.local_addr().unwrap();
        let server_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        tokio::spawn(async move {
            let (stream, _) = ingress.accept().await.unwrap();
            let _ = handle(stream, router, server_addr).await;
        });

        let mut client = TcpStream::connect(ingress_addr).await.unwrap();
        client.write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH]).await.unwrap();
        let mut greeting_reply = [0u8; 2];
        client.read_exact(&mut greeting_reply).await.unwrap();

        // Port 1 on loopback: nothing listens there, so the direct dial fails.
        let mut req = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4];
        req.extend_from_slice(&[127, 0, 0, 1]);
        req.extend_from_slice(&1u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_GENERAL_FAILURE);
    }

    #[tokio::test]
    async fn test_unsupported_command_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        // BIND (0x02) instead of CONNECT.
        let req = vec![SOCKS_VERSION, 0x02, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
        client.write_all(&req).await.unwrap();

        let result = server_task.await.unwrap();
        assert!(result.is_err());
    }
}
