use std::{sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use itertools::Itertools;
use port_keel::{
    cli::{self, Commands, Hangup},
    config::Config,
    logging,
    monitor::{self, MonitorClient},
    process::ProcessLauncher,
};
use tracing::{debug, info, warn, Level};

async fn list(config: &Config, wait: Duration) -> Result<()> {
    let manager = config
        .discovery_manager(Arc::new(ProcessLauncher))
        .await?;

    for e in manager.start().await {
        warn!(%e, "Discovery failed");
    }
    tokio::time::sleep(wait).await;

    let ports = manager.list().await;
    for port in ports.iter().sorted_by_key(|port| port.key()) {
        println!(
            "{}\t{}\t{}",
            port.address, port.protocol, port.protocol_label
        );
    }

    manager.clear().await;
    Ok(())
}

async fn watch(config: &Config) -> Result<()> {
    let manager = config
        .discovery_manager(Arc::new(ProcessLauncher))
        .await?;

    let mut watcher = manager.watch().await;

    let mut hangup = Hangup::new()?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C, quitting");
                break;
            }
            _ = hangup.recv() => {
                info!("Told to hang up, quitting");
                break;
            }
            event = watcher.next() => match event {
                Some(event) => println!("{event}"),
                None => return Err(eyre!("Watcher stopped unexpectedly")),
            }
        }
    }

    manager.clear().await;
    Ok(())
}

async fn run_monitor(
    config: &Config,
    protocol: &str,
    address: &str,
    params: &[(String, String)],
) -> Result<()> {
    let tool = config
        .monitor_for(protocol)
        .ok_or_else(|| eyre!("No monitor configured for protocol `{protocol}`"))?;

    let mut monitor = MonitorClient::new_process(protocol, tool.command.clone())
        .with_user_agent(config.user_agent());

    monitor.run().await?;
    let mut hangup = Hangup::new()?;

    let session = async {
        monitor.describe().await?;
        for (parameter, value) in params {
            monitor.configure(parameter, value).await?;
        }

        let stream = monitor.open(address, protocol).await?;
        info!(%address, "Connected, ctrl-c to quit");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Ctrl-C, quitting"),
            _ = hangup.recv() => info!("Told to hang up, quitting"),
            relayed = monitor::relay(stream, tokio::io::stdin(), tokio::io::stdout()) => relayed?,
        }

        monitor.close().await?;
        Ok::<_, color_eyre::Report>(())
    }
    .await;

    if let Err(e) = monitor.quit().await {
        debug!(%e, "Monitor did not quit cleanly");
    }

    session
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let Commands::Examples(example) = &cli.command {
        cli::handle_example(example.clone())?;

        return Ok(());
    }

    logging::init(cli.log_level, cli.log_dir.map(|dir| (Level::DEBUG, dir)));

    let config = if let Some(config_path) = cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)?
    } else {
        debug!("Default config");
        Config::default()
    };
    config.validate()?;

    match cli.command {
        Commands::List { wait } => list(&config, Duration::from_millis(wait)).await,
        Commands::Watch => watch(&config).await,
        Commands::Monitor {
            protocol,
            address,
            params,
        } => run_monitor(&config, &protocol, &address, &params).await,
        Commands::Examples(_) => Ok(()),
    }
}
