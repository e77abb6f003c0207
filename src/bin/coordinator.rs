use std::{path::PathBuf, process, sync::Arc};

use anyhow::Context;
use federa::{
    coordinator::{server, CoordinatorService},
    settings::CoordinatorSettings,
};
use structopt::StructOpt;
use tokio::{net::TcpListener, signal};
use tracing_subscriber::FmtSubscriber;

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let settings = CoordinatorSettings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let directory = settings.directory();
    let registry = Arc::new(settings.key_registry());
    let CoordinatorSettings {
        api: api_settings,
        scheduler: scheduler_settings,
        log: log_settings,
        ..
    } = settings;

    FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    sodiumoxide::init().map_err(|_| anyhow::anyhow!("failed to initialize libsodium"))?;

    let (service, handle) = CoordinatorService::new(directory, registry, scheduler_settings);
    let listener = TcpListener::bind(api_settings.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", api_settings.bind_address))?;

    tokio::select! {
        _ = service.run() => {
            warn!("shutting down: coordinator service terminated");
        }
        result = server::serve(listener, handle, api_settings) => {
            if let Err(error) = result {
                error!(error = %error, "shutting down: control channel failed");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    Ok(())
}
