//! Server core: dispatches incoming connections and drives the
//! rendezvous-based `open_stream` state machine.

use std::fmt;

use broker::{relay, DeviceRegistry, RendezvousTable, WaitError};
use protocol::{Connect, Request, read_request};
use tokio::net::TcpStream;

#[derive(Debug)]
pub enum OpenStreamError {
    UnknownDevice(String),
    Send(protocol::Error),
    Timeout,
    Cancelled,
}

impl fmt::Display for OpenStreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for OpenStreamError {}

/// Shared broker state: the device registry and the rendezvous table that
/// pairs `Connect` orders with their dial-backs.
#[derive(Clone)]
pub struct Broker {
    pub registry: DeviceRegistry,
    pub rendezvous: RendezvousTable,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            registry: DeviceRegistry::new(),
            rendezvous: RendezvousTable::new(),
        }
    }

    /// Ask `target` (via its control connection) to dial back, and wait for
    /// that dial-back to arrive.
    pub async fn open_stream(&self, target: &str, address: &str, port: u32) -> Result<TcpStream, OpenStreamError> {
        let device = self
            .registry
            .lookup(target)
            .ok_or_else(|| OpenStreamError::UnknownDevice(target.to_string()))?;

        let ticket = self.rendezvous.allocate();
        let id = ticket.id();

        let connect = Connect {
            target: target.to_string(),
            address: address.to_string(),
            port,
            id,
        };

        if let Err(err) = device.send(&Request::Connection(connect)).await {
            return Err(OpenStreamError::Send(err));
        }

        match ticket.wait().await {
            Ok(conn) => Ok(conn),
            Err(WaitError::Timeout) => Err(OpenStreamError::Timeout),
            Err(WaitError::Cancelled) => Err(OpenStreamError::Cancelled),
        }
    }

    /// Deliver a dial-back connection to whichever `open_stream` call
    /// allocated `connid`.
    pub fn deliver(&self, connid: u64, conn: TcpStream) {
        self.rendezvous.deliver(connid, conn);
    }
}

/// Handle one freshly accepted TCP connection: read its first frame and act
/// on the request type it carries.
pub async fn handle(broker: Broker, mut conn: TcpStream) {
    let req = match read_request(&mut conn).await {
        Ok(req) => req,
        Err(err) => {
            log::debug!("failed to read request: {err}");
            return;
        }
    };

    match req {
        Request::Register { uuid } => {
            log::info!("device {uuid} registering");
            if let Err(err) = broker.registry.register(uuid, conn).await {
                log::warn!("register failed: {err:?}");
            }
            // ownership transferred to the registry either way; conn is
            // consumed by `register`.
        }
        Request::Connection(connect) => {
            log::debug!("relay ingress for target {}", connect.target);
            match broker.open_stream(&connect.target, &connect.address, connect.port).await {
                Ok(data) => relay(conn, data).await,
                Err(err) => log::warn!("open_stream failed: {err}"),
            }
        }
        Request::Response(resp) => {
            log::debug!("dial-back for connid {}", resp.connid);
            broker.deliver(resp.connid, conn);
        }
        other => {
            log::debug!("unexpected initial request: {other:?}");
        }
    }
}

/// Run the TCP accept loop, spawning [`handle`] for each connection.
pub async fn run(broker: Broker, host: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(host).await?;
    log::info!("listening on {host}");

    loop {
        let (conn, addr) = listener.accept().await?;
        log::trace!("accepted connection from {addr}");
        let broker = broker.clone();
        tokio::spawn(async move {
            handle(broker, conn).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let a = TcpStream::connect(addr).await.unwrap();
        let b = accept.await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn open_stream_on_unknown_device_fails_fast() {
        let broker = Broker::new();
        let err = broker.open_stream("nope", "127.0.0.1", 22).await.unwrap_err();
        assert!(matches!(err, OpenStreamError::UnknownDevice(_)));
    }

    #[tokio::test]
    async fn open_stream_pairs_with_a_response_conn() {
        let broker = Broker::new();
        let (_control_client, control_server) = connected_pair().await;
        broker.registry.register("d1".into(), control_server).await.unwrap();

        let broker2 = broker.clone();
        let open = tokio::spawn(async move { broker2.open_stream("d1", "127.0.0.1", 22).await });

        // give open_stream a moment to allocate and send its Connect order.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let (data_client, data_server) = connected_pair().await;
        drop(data_client);
        broker.deliver(1, data_server);

        assert!(open.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn response_for_stale_connid_closes_without_panicking() {
        let broker = Broker::new();
        let (_client, server) = connected_pair().await;
        // no awaiter ever allocated id 999; deliver must just drop it.
        broker.deliver(999, server);
    }
}
