//! Device-side core: register with the broker, keep the control connection
//! alive, and service inbound `Connect` orders by dialing back and reaching
//! the requested local target.

use std::time::Duration;

use protocol::{ConnectResponse, Request, read_request, write_request};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Dial timeout for both the initial register connection and every
/// subsequent dial-back, matching the original implementation's
/// `connectServer` dial.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the keepalive task pings the control connection.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Timeout for dialing the local target once a `Connect` order arrives.
const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// A minimum session lifetime below which the surrounding driver must wait
/// out the remainder before redialing, to avoid hot-looping against a
/// server that is refusing connections.
pub const MIN_SESSION: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum DeviceError {
    Dial(std::io::Error),
    DialTimeout,
    Protocol(protocol::Error),
    RegisterRejected(String),
    UnexpectedReply,
}

impl From<protocol::Error> for DeviceError {
    fn from(value: protocol::Error) -> Self {
        Self::Protocol(value)
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for DeviceError {}

/// How the device dials out to the broker server: directly, or through an
/// outbound SOCKS5 proxy (see `socks5::dial_via_proxy`).
#[derive(Clone)]
pub enum Dialer {
    Direct,
    Socks5Proxy(String),
}

impl Dialer {
    async fn connect(&self, server: &str) -> Result<TcpStream, DeviceError> {
        let dial = async {
            match self {
                Self::Direct => TcpStream::connect(server).await,
                Self::Socks5Proxy(proxy) => crate::socks5::dial_via_proxy(proxy, server).await,
            }
        };

        match timeout(DIAL_TIMEOUT, dial).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => Err(DeviceError::Dial(err)),
            Err(_) => Err(DeviceError::DialTimeout),
        }
    }
}

/// Register `uuid` with `server` and service the control connection until
/// it closes or errors. Returns once the session has ended; the caller is
/// expected to redial (see `MIN_SESSION`).
pub async fn register_loop(uuid: &str, server: &str, dialer: &Dialer) -> Result<(), DeviceError> {
    let mut conn = dialer.connect(server).await?;

    write_request(&mut conn, &Request::register(uuid)).await?;
    match read_request(&mut conn).await? {
        Request::Ok => {}
        Request::Error { msg } => return Err(DeviceError::RegisterRejected(msg)),
        _ => return Err(DeviceError::UnexpectedReply),
    }

    log::info!("registered as {uuid} with {server}");

    let (mut read, write) = conn.into_split();
    let write = std::sync::Arc::new(tokio::sync::Mutex::new(write));

    let keepalive = {
        let write = write.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.tick().await; // first tick fires immediately; skip it.
            loop {
                ticker.tick().await;
                let mut guard = write.lock().await;
                if let Err(err) = write_request(&mut *guard, &Request::Ping).await {
                    log::warn!("keepalive failed, closing control connection: {err}");
                    let _ = guard.shutdown().await;
                    break;
                }
            }
        })
    };

    let result = loop {
        match read_request(&mut read).await {
            Ok(Request::Connection(connect)) => {
                let uuid = uuid.to_string();
                let server = server.to_string();
                let dialer = dialer.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connect(&uuid, &server, &dialer, connect).await {
                        log::warn!("handle_connect failed: {err}");
                    }
                });
            }
            Ok(Request::Ping) => {}
            Ok(other) => log::debug!("unexpected request on control conn: {other:?}"),
            Err(err) => break Err(DeviceError::Protocol(err)),
        }
    };

    keepalive.abort();
    result
}

/// Service one inbound `Connect` order: dial back to the server, announce
/// which correlation id this new connection answers, dial the requested
/// local target, and splice the two together.
async fn handle_connect(
    uuid: &str,
    server: &str,
    dialer: &Dialer,
    connect: protocol::Connect,
) -> Result<(), DeviceError> {
    let address = if connect.address.is_empty() {
        "127.0.0.1".to_string()
    } else {
        connect.address.clone()
    };

    let mut remote = dialer.connect(server).await?;
    write_request(
        &mut remote,
        &Request::Response(ConnectResponse { uuid: uuid.to_string(), connid: connect.id }),
    )
    .await?;

    let target = format!("{address}:{}", connect.port);
    let local = match timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(err)) => return Err(DeviceError::Dial(err)),
        Err(_) => return Err(DeviceError::DialTimeout),
    };

    broker::relay(local, remote).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn register_fails_fast_when_server_rejects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let _req = read_request(&mut conn).await.unwrap();
            write_request(&mut conn, &Request::error("no thanks")).await.unwrap();
        });

        let result = register_loop("d1", &addr.to_string(), &Dialer::Direct).await;
        server.await.unwrap();

        assert!(matches!(result, Err(DeviceError::RegisterRejected(_))));
    }

    #[tokio::test]
    async fn register_loop_exits_when_control_conn_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let _req = read_request(&mut conn).await.unwrap();
            write_request(&mut conn, &Request::Ok).await.unwrap();
            drop(conn);
        });

        let result = register_loop("d1", &addr.to_string(), &Dialer::Direct).await;
        server.await.unwrap();

        assert!(matches!(result, Err(DeviceError::Protocol(_))));
    }
}
