//! Demo strand server: an echo service authenticated against GitHub keys.
//!
//! Listens on `STRAND_ADDRESS` (default `127.0.0.1:7543`) and accepts any
//! connection whose identity is a GitHub user offering one of their
//! published keys. The single registered session, `echo`, sends every
//! packet straight back.

use std::env::var;
use std::sync::Arc;

use eyre::Result as EyreResult;
use strand_keys::GithubKeyRegistry;
use strand_rpc::transport::tcp::TcpAcceptor;
use strand_rpc::{handler_fn, Server};
use tracing::info;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, EnvFilter};

const DEFAULT_ADDRESS: &str = "127.0.0.1:7543";

#[tokio::main]
async fn main() -> EyreResult<()> {
    setup()?;

    let address = var("STRAND_ADDRESS").unwrap_or_else(|_| DEFAULT_ADDRESS.to_owned());

    let keys = Arc::new(GithubKeyRegistry::new());
    let acceptor = TcpAcceptor::bind(&address, keys).await?;

    info!(address = %acceptor.local_addr()?, "listening");

    let server = Arc::new(Server::new());

    server.register_handler(
        "echo",
        handler_fn(|session| async move {
            while let Ok(Some(packet)) = session.recv().await {
                if session.send(packet).await.is_err() {
                    break;
                }
            }
        }),
    );

    let serve = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(acceptor).await })
    };

    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    server.close();

    serve.await??;

    Ok(())
}

fn setup() -> EyreResult<()> {
    let directives = match var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => "strandd=info,strand_=info".to_owned(),
    };

    registry()
        .with(EnvFilter::builder().parse(directives)?)
        .with(layer())
        .init();

    color_eyre::install()?;

    Ok(())
}
