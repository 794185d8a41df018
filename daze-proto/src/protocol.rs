/// Wire protocol: the handshake frames and the FramedConn that carries them.
///
/// Byte-exact layout (client → server), everything after the raw key XORed
/// with the keystream derived from it:
/// ```text
/// [0..128)     raw key K, unobfuscated
/// [128..130)   0xFF 0xFF magic                 ─┐
/// [130..248)   random padding                   │ authenticity frame (128 B)
/// [248..256)   big-endian UNIX timestamp        ─┘
/// [256]        0x01 (CONNECT)                   ─┐
/// [257]        L, address length (1..255)        │ destination frame (258 B)
/// [258..258+L) ASCII "host:port"                 │
/// [258+L..514) random padding                   ─┘
/// ```
/// Server → client after the handshake: raw tunneled payload, obfuscated.
use crate::keystream::Keystream;
use rand::Rng;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

// ── Wire constants ──────────────────────────────────────────────────

/// Raw, unobfuscated key material sent at the start of every session.
pub const KEY_LEN: usize = 128;
/// First obfuscated block: magic + replay-window timestamp + padding.
pub const AUTH_FRAME_LEN: usize = 128;
/// Second obfuscated block: command + address length + address + padding.
pub const DEST_FRAME_LEN: usize = 258;
/// The client sends both frames as one logical write of this many bytes.
pub const HANDSHAKE_PAYLOAD_LEN: usize = AUTH_FRAME_LEN + DEST_FRAME_LEN;
/// Acceptable clock skew between client and server, in seconds.
pub const AUTH_WINDOW_SECS: i64 = 60;
/// Longest address ("host:port") the destination frame can carry.
pub const MAX_ADDRESS_LEN: usize = 255;

const AUTH_MAGIC: [u8; 2] = [0xFF, 0xFF];
const TIMESTAMP_OFFSET: usize = 120;
const TIMESTAMP_LEN: usize = 8;
const CMD_CONNECT: u8 = 0x01;

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_secs()
}

// ── Handshake payload (client side) ─────────────────────────────────

/// Build the 386-byte handshake payload: authenticity frame (magic +
/// timestamp + padding) followed by the destination frame (CONNECT command
/// + address) for `address` ("host:port", 1..=255 bytes).
///
/// The timestamp is written as a 4-byte big-endian UNIX second count,
/// left-padded with zero bytes into the 8-byte field the server reads as a
/// big-endian u64 — this only agrees with the server's interpretation until
/// the 4-byte value wraps around the year 2106. Kept this way deliberately
/// for wire compatibility with existing deployments rather than widening it.
pub fn build_handshake_payload(address: &str) -> io::Result<Vec<u8>> {
    let addr_bytes = address.as_bytes();
    if addr_bytes.is_empty() || addr_bytes.len() > MAX_ADDRESS_LEN {
        return Err(invalid_data("address length out of range"));
    }

    let mut buf = vec![0u8; HANDSHAKE_PAYLOAD_LEN];
    // One bulk RNG call for all padding, rather than sampling byte by byte.
    rand::thread_rng().fill(&mut buf[..]);

    buf[0] = AUTH_MAGIC[0];
    buf[1] = AUTH_MAGIC[1];

    let secs = now_unix() as u32;
    buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 4].copy_from_slice(&[0, 0, 0, 0]);
    buf[TIMESTAMP_OFFSET + 4..TIMESTAMP_OFFSET + TIMESTAMP_LEN].copy_from_slice(&secs.to_be_bytes());

    let dest_start = AUTH_FRAME_LEN;
    buf[dest_start] = CMD_CONNECT;
    buf[dest_start + 1] = addr_bytes.len() as u8;
    buf[dest_start + 2..dest_start + 2 + addr_bytes.len()].copy_from_slice(addr_bytes);

    Ok(buf)
}

// ── Handshake frame parsing (server side) ───────────────────────────

/// Validate a deobfuscated 128-byte authenticity frame: magic bytes and a
/// timestamp within `AUTH_WINDOW_SECS` of the server clock.
pub fn parse_auth_frame(frame: &[u8]) -> io::Result<()> {
    if frame.len() != AUTH_FRAME_LEN {
        return Err(invalid_data("short authenticity frame"));
    }
    if frame[0] != AUTH_MAGIC[0] || frame[1] != AUTH_MAGIC[1] {
        return Err(invalid_data("malformed request: bad magic"));
    }
    let ts_bytes: [u8; 8] = frame[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + TIMESTAMP_LEN]
        .try_into()
        .unwrap();
    let ts = u64::from_be_bytes(ts_bytes);
    let now = now_unix();
    let skew = (now as i64) - (ts as i64);
    if skew.abs() > AUTH_WINDOW_SECS {
        return Err(invalid_data("expired handshake timestamp"));
    }
    Ok(())
}

/// Parse a deobfuscated 258-byte destination frame into `(host, port)`.
pub fn parse_dest_frame(frame: &[u8]) -> io::Result<(String, u16)> {
    if frame.len() != DEST_FRAME_LEN {
        return Err(invalid_data("short destination frame"));
    }
    let len = frame[1] as usize;
    if len == 0 || len > MAX_ADDRESS_LEN {
        return Err(invalid_data("bad destination address length"));
    }
    let addr = std::str::from_utf8(&frame[2..2 + len])
        .map_err(|_| invalid_data("destination address is not UTF-8"))?;
    let (host, port_str) = addr
        .rsplit_once(':')
        .ok_or_else(|| invalid_data("destination address missing port"))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| invalid_data("destination address has invalid port"))?;
    Ok((host.to_string(), port))
}

// ── FramedConn ───────────────────────────────────────────────────────

/// Wraps a raw bidirectional stream with one keystream per direction.
/// Owns the stream for its whole lifetime; dropping it closes the
/// underlying stream and destroys both keystreams along with it — there is
/// no separate `close`, `Drop` already makes it idempotent.
pub struct FramedConn<S> {
    stream: S,
    write_ks: Keystream,
    read_ks: Keystream,
}

impl<S> FramedConn<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    /// Seed both directions' keystreams from the same key.
    pub fn new(stream: S, key: &[u8]) -> io::Result<Self> {
        let write_ks = Keystream::new(key).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let read_ks = Keystream::new(key).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(Self {
            stream,
            write_ks,
            read_ks,
        })
    }

    /// Obfuscate `data` and write it to the underlying stream, looping
    /// until the whole buffer lands (short writes are not visible to the
    /// caller).
    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut buf = data.to_vec();
        self.write_ks.apply(&mut buf);
        self.stream.write_all(&buf).await
    }

    /// Read up to `max` bytes, deobfuscate them, and return them. An empty
    /// result means end of stream.
    pub async fn recv(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = self.stream.read(&mut buf).await?;
        buf.truncate(n);
        self.read_ks.apply(&mut buf);
        Ok(buf)
    }

    /// Read exactly `n` bytes, deobfuscate them, and return them — used for
    /// the fixed-size handshake frames, where a short read means the peer
    /// closed mid-handshake.
    pub async fn recv_exact(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).await?;
        self.read_ks.apply(&mut buf);
        Ok(buf)
    }
}

impl FramedConn<TcpStream> {
    /// Split into independent read/write halves so a splice can drive both
    /// directions concurrently without the two keystreams ever touching
    /// shared state.
    pub fn into_split(self) -> (FramedReader, FramedWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            FramedReader {
                half: read_half,
                ks: self.read_ks,
            },
            FramedWriter {
                half: write_half,
                ks: self.write_ks,
            },
        )
    }
}

/// The read half of a split `FramedConn<TcpStream>`.
pub struct FramedReader {
    half: OwnedReadHalf,
    ks: Keystream,
}

impl FramedReader {
    pub async fn recv(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = self.half.read(&mut buf).await?;
        buf.truncate(n);
        self.ks.apply(&mut buf);
        Ok(buf)
    }
}

/// The write half of a split `FramedConn<TcpStream>`.
pub struct FramedWriter {
    half: OwnedWriteHalf,
    ks: Keystream,
}

impl FramedWriter {
    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut buf = data.to_vec();
        self.ks.apply(&mut buf);
        self.half.write_all(&buf).await
    }
}
