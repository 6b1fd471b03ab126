use anyhow::Result;
use clap::Parser;
use log::info;
use tamchain_p2p::cli::{load_identity, Cli, Commands};
use tamchain_p2p::{MessageType, NetService};

const TX_SUBSCRIPTION_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Id(args) => {
            let config = args.into_config()?;
            println!("{}", load_identity(&config)?.peer_id());
        }
        Commands::Run(args) => {
            let config = args.into_config()?;
            info!("=== Starting TamChain p2p node ===");

            let service = NetService::new(config).await?;
            service.start().await?;

            let mut txs = service
                .peer_manager()
                .subscribe(MessageType::PublishTx, TX_SUBSCRIPTION_CAPACITY)
                .await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    Some(msg) = txs.recv() => {
                        info!("Received transaction. from={} size={}", msg.from.short(), msg.data.len());
                    }
                }
            }

            info!("Shutting down.");
            service.stop().await;
        }
    }
    Ok(())
}
