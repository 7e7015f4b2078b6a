//! Wire protocol for the reverse TCP tunnel broker.
//!
//! Every message on a control or data connection is a length-prefixed,
//! `bincode`-encoded [`Request`]. The length prefix is a big-endian `u64` and
//! must describe a body between 1 and 65535 bytes inclusive; anything outside
//! that range is a framing violation and the connection must be closed.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are refused without reading the body.
pub const MAX_FRAME_LEN: u64 = 0xffff;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Encode(bincode::Error),
    Framing(String),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<bincode::Error> for Error {
    fn from(value: bincode::Error) -> Self {
        Self::Encode(value)
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The target of a dial-back: which device, and what it should reach once it
/// has dialed back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connect {
    pub target: String,
    pub address: String,
    pub port: u32,
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectResponse {
    pub uuid: String,
    pub connid: u64,
}

/// The single message type multiplexed over control and data connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Request {
    /// device -> server: claim a uuid, take ownership of this conn.
    Register { uuid: String },
    /// server -> device: register accepted.
    Ok,
    /// server -> device: register rejected.
    Error { msg: String },
    /// device -> server: keepalive.
    Ping,
    /// server -> device (control), or ingress -> server (new conn): dial
    /// back and reach a target.
    Connection(Connect),
    /// device -> server (new conn): this connection is the dial-back for
    /// `connid`.
    Response(ConnectResponse),
}

impl Request {
    pub fn register(uuid: impl Into<String>) -> Self {
        Self::Register { uuid: uuid.into() }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error { msg: msg.into() }
    }
}

/// Read one frame: an 8-byte big-endian length prefix followed by exactly
/// that many bytes of `bincode`-encoded [`Request`].
pub async fn read_request<R>(reader: &mut R) -> Result<Request, Error>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 8];
    reader.read_exact(&mut len_buf).await?;
    let len = u64::from_be_bytes(len_buf);

    if len == 0 || len > MAX_FRAME_LEN {
        return Err(Error::Framing(format!("invalid length: {len}")));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    Ok(bincode::deserialize(&body)?)
}

/// Encode `req` and write it as one frame: length prefix then body, in a
/// single write so concurrent writers on the same connection cannot
/// interleave a partial frame (callers must still serialize writers with a
/// mutex, since a single write call is not atomic with respect to other
/// writers racing on the same stream).
pub async fn write_request<W>(writer: &mut W, req: &Request) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(req)?;

    if body.is_empty() || body.len() as u64 > MAX_FRAME_LEN {
        return Err(Error::Framing(format!("invalid length: {}", body.len())));
    }

    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
    frame.extend_from_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(req: Request) -> Request {
        let mut buf = Vec::new();
        write_request(&mut buf, &req).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        read_request(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn round_trips_every_variant() {
        assert_eq!(round_trip(Request::register("d1")).await, Request::register("d1"));
        assert_eq!(round_trip(Request::Ok).await, Request::Ok);
        assert_eq!(round_trip(Request::error("nope")).await, Request::error("nope"));
        assert_eq!(round_trip(Request::Ping).await, Request::Ping);

        let connect = Connect {
            target: "d1".into(),
            address: "127.0.0.1".into(),
            port: 22,
            id: 7,
        };
        assert_eq!(
            round_trip(Request::Connection(connect.clone())).await,
            Request::Connection(connect)
        );

        let resp = ConnectResponse { uuid: "d1".into(), connid: 7 };
        assert_eq!(
            round_trip(Request::Response(resp.clone())).await,
            Request::Response(resp)
        );
    }

    #[tokio::test]
    async fn rejects_zero_length() {
        let mut cursor = std::io::Cursor::new(0u64.to_be_bytes().to_vec());
        assert!(matches!(read_request(&mut cursor).await, Err(Error::Framing(_))));
    }

    #[tokio::test]
    async fn rejects_oversize_length_without_reading_body() {
        let mut buf = (MAX_FRAME_LEN + 1).to_be_bytes().to_vec();
        // no body appended: if the reader tried to consume it, it would hang
        // on read_exact and this test would time out instead of failing fast.
        let mut cursor = std::io::Cursor::new(std::mem::take(&mut buf));
        assert!(matches!(read_request(&mut cursor).await, Err(Error::Framing(_))));
    }

    #[tokio::test]
    async fn rejects_truncated_body() {
        let mut buf = 10u64.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 3]);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(read_request(&mut cursor).await, Err(Error::Io(_))));
    }
}
