//! Minimal SOCKS5 support: an ingress server that decodes a CONNECT request
//! into a tunnel target, and an outbound client used by devices that must
//! reach the broker through a SOCKS5 proxy.
//!
//! Destination encoding follows the original implementation's `api.Stream`:
//! the CONNECT destination's hostname *is* the device uuid, and the address
//! reached on the device side is always `127.0.0.1`; only the port carries
//! through unchanged.

use std::fmt;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use broker::relay;

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug)]
pub enum Socks5Error {
    Io(std::io::Error),
    UnsupportedVersion(u8),
    UnsupportedCommand(u8),
    UnsupportedAddressType(u8),
    ProxyRejected(u8),
}

impl From<std::io::Error> for Socks5Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl fmt::Display for Socks5Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Socks5Error {}

/// The destination of one decoded SOCKS5 CONNECT request: device uuid
/// (taken from the hostname) and the port to reach on that device.
pub struct Destination {
    pub uuid: String,
    pub port: u16,
}

/// Run a SOCKS5 ingress listener, handing each decoded destination to
/// `open_stream` and splicing the result with the client connection.
pub async fn run<F, Fut>(listen: &str, open_stream: F) -> std::io::Result<()>
where
    F: Fn(Destination) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = Result<TcpStream, Box<dyn std::error::Error + Send + Sync>>> + Send,
{
    let listener = TcpListener::bind(listen).await?;
    log::info!("socks5 ingress listening on {listen}");

    loop {
        let (conn, addr) = listener.accept().await?;
        log::trace!("socks5 accepted {addr}");
        let open_stream = open_stream.clone();

        tokio::spawn(async move {
            if let Err(err) = serve_one(conn, open_stream).await {
                log::warn!("socks5 session from {addr} failed: {err}");
            }
        });
    }
}

async fn serve_one<F, Fut>(mut conn: TcpStream, open_stream: F) -> Result<(), Socks5Error>
where
    F: FnOnce(Destination) -> Fut,
    Fut: std::future::Future<Output = Result<TcpStream, Box<dyn std::error::Error + Send + Sync>>>,
{
    negotiate_no_auth(&mut conn).await?;
    let dest = read_connect_request(&mut conn).await?;

    match open_stream(dest).await {
        Ok(data) => {
            write_reply(&mut conn, 0x00).await?;
            relay(conn, data).await;
            Ok(())
        }
        Err(err) => {
            log::warn!("open_stream failed for socks5 request: {err}");
            write_reply(&mut conn, 0x01).await?;
            Ok(())
        }
    }
}

async fn negotiate_no_auth(conn: &mut TcpStream) -> Result<(), Socks5Error> {
    let mut header = [0u8; 2];
    conn.read_exact(&mut header).await?;
    let [version, nmethods] = header;

    if version != VERSION {
        return Err(Socks5Error::UnsupportedVersion(version));
    }

    let mut methods = vec![0u8; nmethods as usize];
    conn.read_exact(&mut methods).await?;

    conn.write_all(&[VERSION, NO_AUTH]).await?;
    Ok(())
}

async fn read_connect_request(conn: &mut TcpStream) -> Result<Destination, Socks5Error> {
    let mut head = [0u8; 4];
    conn.read_exact(&mut head).await?;
    let [version, cmd, _reserved, atyp] = head;

    if version != VERSION {
        return Err(Socks5Error::UnsupportedVersion(version));
    }
    if cmd != CMD_CONNECT {
        return Err(Socks5Error::UnsupportedCommand(cmd));
    }

    let uuid = match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await?;
            std::net::Ipv4Addr::from(buf).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            conn.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16];
            conn.read_exact(&mut buf).await?;
            std::net::Ipv6Addr::from(buf).to_string()
        }
        other => return Err(Socks5Error::UnsupportedAddressType(other)),
    };

    let mut port_buf = [0u8; 2];
    conn.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    Ok(Destination { uuid, port })
}

async fn write_reply(conn: &mut TcpStream, rep: u8) -> Result<(), Socks5Error> {
    // BND.ADDR/BND.PORT are unused by any client of this relay; report
    // 0.0.0.0:0, matching what most minimal SOCKS5 relays return.
    let mut reply = vec![VERSION, rep, 0x00, ATYP_IPV4];
    reply.extend_from_slice(&[0, 0, 0, 0]);
    reply.extend_from_slice(&[0, 0]);
    conn.write_all(&reply).await?;
    Ok(())
}

/// Dial `target` through a SOCKS5 proxy at `proxy`, performing a minimal
/// no-auth CONNECT handshake. Used by the device side to reach the broker
/// server through an outbound SOCKS5 proxy.
pub async fn dial_via_proxy(proxy: &str, target: &str) -> std::io::Result<TcpStream> {
    let mut conn = TcpStream::connect(proxy).await?;

    conn.write_all(&[VERSION, 1, NO_AUTH]).await?;
    let mut method_reply = [0u8; 2];
    conn.read_exact(&mut method_reply).await?;
    if method_reply != [VERSION, NO_AUTH] {
        return Err(std::io::Error::new(std::io::ErrorKind::Other, "socks5 proxy rejected no-auth"));
    }

    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "target must be host:port"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid port"))?;

    let mut request = vec![VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN];
    request.push(host.len() as u8);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    conn.write_all(&request).await?;

    let mut head = [0u8; 4];
    conn.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(std::io::Error::new(std::io::ErrorKind::Other, format!("socks5 proxy rejected connect: {}", head[1])));
    }

    match head[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4 + 2];
            conn.read_exact(&mut buf).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            conn.read_exact(&mut rest).await?;
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16 + 2];
            conn.read_exact(&mut buf).await?;
        }
        _ => {}
    }

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn decodes_domain_destination_as_target_uuid() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            negotiate_no_auth(&mut conn).await.unwrap();
            read_connect_request(&mut conn).await.unwrap()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[VERSION, 1, NO_AUTH]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        let uuid = "device-1";
        let mut req = vec![VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, uuid.len() as u8];
        req.extend_from_slice(uuid.as_bytes());
        req.extend_from_slice(&22u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let dest = server.await.unwrap();
        assert_eq!(dest.uuid, "device-1");
        assert_eq!(dest.port, 22);
    }
}
