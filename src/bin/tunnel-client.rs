#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::time::Instant;

use clap::Parser;

use tunnel::config::{ClientCli, RuleFile};
use tunnel::device::{register_loop, Dialer, MIN_SESSION};
use tunnel::ingress::spawn_forwards;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = ClientCli::parse();
    simple_logger::init_with_level(cli.log_level.as_level())?;

    let dialer = match cli.s5_proxy.clone() {
        Some(proxy) => Dialer::Socks5Proxy(proxy),
        None => Dialer::Direct,
    };

    let rules = RuleFile::load(cli.rules.as_deref())?;
    spawn_forwards(&rules, &cli.server);

    if let Some(s5_addr) = cli.s5_server.clone() {
        let server = cli.server.clone();
        tokio::spawn(async move {
            let result = tunnel::socks5::run(&s5_addr, move |dest| {
                let server = server.clone();
                async move {
                    tunnel::ingress::open_stream(
                        &server,
                        &tunnel::config::Target { uuid: dest.uuid, address: String::new(), port: dest.port },
                    )
                    .await
                    .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
                }
            })
            .await;

            if let Err(err) = result {
                log::error!("socks5 listener on {s5_addr} failed: {err}");
            }
        });
    }

    loop {
        let started = Instant::now();

        if let Err(err) = register_loop(&cli.uuid, &cli.server, &dialer).await {
            log::warn!("session with {} ended: {err}", cli.server);
        }

        let elapsed = started.elapsed();
        if elapsed < MIN_SESSION {
            tokio::time::sleep(MIN_SESSION - elapsed).await;
        }
    }
}
