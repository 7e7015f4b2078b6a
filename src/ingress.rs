//! Static-forward ingress: listen on a fixed `host:port` and forward every
//! accepted connection to a fixed device target.

use broker::relay;
use protocol::{Connect, Request, read_request, write_request};
use tokio::net::{TcpListener, TcpStream};

use crate::config::Target;

/// Open a new connection to the broker server and issue a `Connection`
/// order for `target`, returning the resulting data connection once the
/// server has paired it with the device's dial-back.
pub async fn open_stream(server: &str, target: &Target) -> Result<TcpStream, protocol::Error> {
    let mut conn = TcpStream::connect(server).await?;

    write_request(
        &mut conn,
        &Request::Connection(Connect {
            target: target.uuid.clone(),
            address: target.address.clone(),
            port: target.port as u32,
            // id 0: the server assigns the real correlation id and ignores
            // whatever the ingress side sends here.
            id: 0,
        }),
    )
    .await?;

    Ok(conn)
}

/// Run one static forward: accept connections on `listen`, and for each,
/// open a stream to `target` via `server` and splice the two together.
pub async fn forward(listen: &str, server: String, target: Target) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    log::info!("forwarding {listen} -> {}@{}:{}", target.uuid, target.address, target.port);

    loop {
        let (conn, addr) = listener.accept().await?;
        log::trace!("forward accepted {addr}");

        let server = server.clone();
        let target = target.clone();
        tokio::spawn(async move {
            match open_stream(&server, &target).await {
                Ok(data) => relay(conn, data).await,
                Err(err) => log::warn!("forward to {} failed: {err}", target.uuid),
            }
        });
    }
}

/// Spawn one task per rule in `rules`, each running [`forward`].
pub fn spawn_forwards(rules: &crate::config::RuleFile, server: &str) {
    for (listen, target) in rules.rules.iter() {
        let listen = listen.clone();
        let server = server.to_string();
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(err) = forward(&listen, server, target).await {
                log::error!("forward listener {listen} failed: {err}");
            }
        });
    }
}
