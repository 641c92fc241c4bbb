use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vm_provision_core::utils::cli::{self, Cli, Commands, CreateArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    let command = match args.command {
        Commands::Init { force } => {
            let dir = args.config.unwrap_or_else(|| PathBuf::from("config"));
            return cli::init_config(&dir, force);
        }
        command => command,
    };

    let settings = cli::load_settings(args.config.as_deref())?;
    info!(
        fake = settings.backend.fake,
        networks = %settings.network.config_dir.display(),
        "Starting VM provisioning core"
    );

    match command {
        Commands::Networks => cli::list_networks(&settings)?,
        Commands::Mac { count } => cli::preview_macs(&settings, count)?,
        Commands::Create {
            name,
            image,
            count,
            memory,
            vcpus,
            networks,
            token,
            caller,
            trash,
            wait,
        } => {
            cli::create_instances(
                &settings,
                CreateArgs {
                    name,
                    image,
                    count,
                    memory,
                    vcpus,
                    networks,
                    token,
                    caller,
                    trash,
                    wait,
                },
            )
            .await?
        }
        Commands::Init { .. } => {}
    }

    Ok(())
}
