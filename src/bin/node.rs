use std::{path::PathBuf, process, sync::Arc};

use anyhow::Context;
use federa::{
    crypto::{ByteObject, EncryptKeyPair},
    node::{self, DockerEngine, StaticRendezvous},
    settings::NodeSettings,
};
use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::FmtSubscriber;

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "node")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,

    #[structopt(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Print the public keys derived from the configured seeds, to register the node with the
    /// coordinator
    Keys,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let mut settings = NodeSettings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    sodiumoxide::init().map_err(|_| anyhow::anyhow!("failed to initialize libsodium"))?;

    if let Some(Command::Keys) = opt.command {
        print_keys(&settings);
        return Ok(());
    }

    FmtSubscriber::builder()
        .with_env_filter(std::mem::take(&mut settings.log.filter))
        .with_ansi(true)
        .init();

    let engine = Arc::new(
        DockerEngine::connect()
            .await
            .context("the container engine is not available")?,
    );
    let rendezvous = Arc::new(StaticRendezvous::new(&settings.network));
    let (client, sandbox, bridge) = node::build(&settings, engine, rendezvous);

    let swept = sandbox
        .sweep_orphans()
        .await
        .context("failed to sweep orphaned containers")?;
    if swept > 0 {
        warn!(swept, "removed containers left behind by a previous run");
    }
    if settings.network.address.is_some() {
        bridge.register().await.context("overlay registration failed")?;
    }

    info!(node_id = %settings.node_id(), "node starting");
    client
        .run(async {
            let _ = signal::ctrl_c().await;
            info!("shutting down");
        })
        .await;
    Ok(())
}

fn print_keys(settings: &NodeSettings) {
    println!("node = {}", settings.node.id);
    println!("signing_key = \"{}\"", settings.signing_keys().public.to_hex());
    for collaboration in &settings.collaborations {
        let keys = EncryptKeyPair::derive_from_seed(&collaboration.encrypt_seed);
        println!(
            "collaboration {}: encrypt_key = \"{}\"",
            collaboration.id,
            keys.public.to_hex()
        );
    }
}
