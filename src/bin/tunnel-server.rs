#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;

use tunnel::config::{RuleFile, ServerCli};
use tunnel::ingress::spawn_forwards;
use tunnel::server::{run, Broker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = ServerCli::parse();
    simple_logger::init_with_level(cli.log_level.as_level())?;

    let rules = RuleFile::load(cli.rules.as_deref())?;
    if rules.rules.is_empty() && cli.rules.is_some() {
        log::warn!("rule file {:?} produced no forwards", cli.rules);
    }

    let broker = Broker::new();

    spawn_forwards(&rules, &cli.host);

    if let Some(s5_addr) = cli.s5_server.clone() {
        let broker = broker.clone();
        tokio::spawn(async move {
            let result = tunnel::socks5::run(&s5_addr, move |dest| {
                let broker = broker.clone();
                async move {
                    broker
                        .open_stream(&dest.uuid, "127.0.0.1", dest.port as u32)
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

    run(broker, &cli.host).await?;
    Ok(())
}
