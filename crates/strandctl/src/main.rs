//! Demo strand client: forwards stdin lines to a server's `echo` session
//! and prints what comes back.

use std::env::var;

use clap::Parser;
use eyre::{eyre, Result as EyreResult, WrapErr};
use strand_rpc::Client;
use strand_wire::Packet;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, EnvFilter};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to dial.
    #[arg(long, env = "STRAND_ADDRESS", default_value = "127.0.0.1:7543")]
    addr: String,

    /// Identity to claim (a GitHub username, for the stock server).
    #[arg(long)]
    user: String,

    /// Path to the public key file to offer (authorized-keys text form).
    #[arg(long)]
    key_file: String,
}

#[tokio::main]
async fn main() -> EyreResult<()> {
    setup()?;

    let args = Args::parse();

    let key = tokio::fs::read_to_string(&args.key_file)
        .await
        .wrap_err_with(|| format!("failed to read key file {}", args.key_file))?;

    let key = key
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| eyre!("key file {} is empty", args.key_file))?;

    let client = Client::connect(&args.addr, &args.user, key).await?;

    let session = client.open_streaming("echo", 0, 0).await?;

    let mut lines = BufReader::new(stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        session.send(Packet::new(line.into_bytes())).await?;

        let Some(reply) = session.recv().await? else {
            eprintln!("server closed the session");
            break;
        };

        println!("{}", String::from_utf8_lossy(&reply.data));
    }

    client.close().await;

    Ok(())
}

fn setup() -> EyreResult<()> {
    let directives = match var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => "strandctl=info,strand_=warn".to_owned(),
    };

    registry()
        .with(EnvFilter::builder().parse(directives)?)
        .with(layer())
        .init();

    color_eyre::install()?;

    Ok(())
}
