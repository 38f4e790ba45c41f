//! meshsyncd - replicates an append log with the peers listed in its config.
//!
//! Lines read from stdin are appended locally; the merged log is logged as
//! it changes.

use meshsync::config::Config;
use meshsync::keys::{Keys, RingKeys};
use meshsync::telemetry::{PeerNames, pretty_clock};
use meshsync::transport::TcpTransport;
use meshsync::{Collaboration, Shared, http, metrics};
use meshsync_crdt::AppendLog;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let first = args.next();

    if first.as_deref() == Some("--generate-keys") {
        let keys = RingKeys::generate_config()?;
        println!("[keys]");
        println!("signing_key = \"{}\"", keys.signing_key);
        println!("cipher_key = \"{}\"", keys.cipher_key);
        return Ok(());
    }

    let config_path = first.unwrap_or_else(|| "meshsync.toml".to_string());
    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("failed to load {config_path}: {e}");
        e
    })?;
    init_tracing(&config.node.log_format);

    let local = config.replica_id();
    info!(
        id = %local,
        listen = %config.node.listen,
        collaboration = %config.node.collaboration,
        peers = config.peers.len(),
        "Starting meshsyncd"
    );

    // metrics_port absent disables the HTTP endpoint.
    if let Some(port) = config.node.metrics_port {
        metrics::init();
        tokio::spawn(http::run_http_server(port));
    }

    let transport = TcpTransport::bind(local.clone(), config.node.listen).await?;
    for peer in &config.peers {
        transport.add_address(peer.id.as_str().into(), peer.address);
    }

    let log = Arc::new(AppendLog::new(local.clone(), config.node.collaboration.clone()));
    let mut builder = Collaboration::builder(
        config.node.collaboration.clone(),
        log.clone(),
        transport.clone(),
    )
    .options(config.replication.clone());
    if let Some(keys) = &config.keys {
        let keys: Arc<dyn Keys> = Arc::new(RingKeys::from_config(keys)?);
        builder = builder.keys(keys);
    } else {
        warn!("No keys configured, payloads are sent in the clear");
    }
    let collab = builder.build();

    for peer in &config.peers {
        collab.ring().add(&peer.id.as_str().into());
    }
    collab.start();

    let names: PeerNames = std::iter::once(&local).collect();
    let mut clock_rx = log.subscribe_clock();
    tokio::spawn({
        let log = log.clone();
        async move {
            while clock_rx.changed().await.is_ok() {
                let clock = clock_rx.borrow_and_update().clone();
                info!(entries = log.len(), clock = %pretty_clock(&names, &clock), "Log changed");
                debug!(value = ?log.value(), "Log value");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interrupted = false;
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if let Err(e) = log.push(line) {
                        error!(error = %e, "Failed to append");
                    }
                }
                Ok(None) => {
                    info!("stdin closed, replicating until interrupted");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read stdin");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }
        }
    }
    if !interrupted {
        tokio::signal::ctrl_c().await?;
    }
    info!("Interrupted, shutting down");

    collab.stop().await;
    transport.close();
    info!("meshsyncd stopped");
    Ok(())
}
