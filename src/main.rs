use clap::Parser;
use std::path::Path;
use tokio::net::TcpListener;

use daisy_node::chain::Chain;
use daisy_node::chainparams::{ChainParams, CHAIN_PARAMS_BASENAME};
use daisy_node::config::{Cli, Command, Config};
use daisy_node::node::Node;
use daisy_node::p2p::coordinator;
use daisy_node::{cli, crypto, db, p2p, webserver};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();
    let cfg = Config::load(&args)?;

    if cfg.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "daisy_node=info".parse().expect("default filter")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "daisy_node=info".parse().expect("default filter")),
            )
            .init();
    }

    tracing::info!("daisy-node v{} starting", env!("CARGO_PKG_VERSION"));

    // Commands that create the data directory run before anything else.
    match &args.command {
        Some(Command::Newchain { params }) => {
            cli::new_chain(&cfg, params)?;
            return Ok(());
        }
        Some(Command::Pull { url }) => {
            cli::pull(&cfg, url).await?;
            return Ok(());
        }
        _ => {}
    }

    let params_path = Path::new(&cfg.data_dir).join(CHAIN_PARAMS_BASENAME);
    let params = ChainParams::load(&params_path).map_err(|e| {
        format!(
            "{}; initialize this node with `newchain` or `pull` first",
            e
        )
    })?;

    let (main_db, private_db) = db::init(&cfg.data_dir, &params.bootstrap_peers)?;
    crypto::ensure_default_keypair(&main_db, &private_db)?;

    // Genesis bootstrap and the full re-verification pass; any failure
    // here is fatal.
    let chain = Chain::new(
        main_db.clone(),
        private_db.clone(),
        params.clone(),
        &cfg.data_dir,
    );
    let chain = tokio::task::spawn_blocking(move || chain.init().map(|_| chain)).await??;
    tracing::info!(height = chain.height()?, "Blockchain verified");

    match &args.command {
        Some(Command::Mykeys) => {
            cli::my_keys(&private_db)?;
            return Ok(());
        }
        Some(Command::Query { sql }) => {
            cli::query(&chain, sql)?;
            return Ok(());
        }
        Some(Command::Signimportblock { file }) => {
            let height = cli::sign_import_block(&chain, file)?;
            tracing::info!(height, "Block imported");
            return Ok(());
        }
        Some(Command::Newchain { .. }) | Some(Command::Pull { .. }) => unreachable!(),
        None => {}
    }

    let (ctrl_tx, ctrl_rx) = coordinator::ctrl_channel();
    let node = Node::new(cfg, params, main_db, private_db, chain, ctrl_tx);

    let p2p_listener = TcpListener::bind(("0.0.0.0", node.cfg.p2p_port)).await?;
    tracing::info!("P2P listening on port {}", node.cfg.p2p_port);
    tokio::spawn(p2p::serve(node.clone(), p2p_listener));

    tokio::spawn(coordinator::run(node.clone(), ctrl_rx));
    tokio::spawn(p2p::connect_saved_peers(node.clone()));

    let http_listener = TcpListener::bind(("0.0.0.0", node.cfg.http_port)).await?;
    tracing::info!("HTTP listening on port {}", node.cfg.http_port);
    tokio::spawn(webserver::serve(node.clone(), http_listener));

    wait_for_shutdown().await;
    tracing::info!("Shutting down");
    Ok(())
}

/// Terminate promptly on SIGINT or SIGTERM; sessions and partial block
/// transfers are not drained.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
