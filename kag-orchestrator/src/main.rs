use clap::Parser;
use kag_common::KagError;
use kag_providers::CloudProvider;
use kag_orchestrator::cli::{Cli, Command};
use kag_orchestrator::commands::{self, Context};
use kag_orchestrator::config::{self, DesiredConfig};
use kag_orchestrator::provider_manager::ProviderManager;
use kag_orchestrator::remote::SshConnector;
use kag_orchestrator::state_store::StateStore;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        if e.may_be_billing() {
            eprintln!("⚠️  The droplet may still exist and be billing. Check the DigitalOcean console, or run `down`.");
        }
        return Err(e.into());
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), KagError> {
    let store = StateStore::new(cli.state_file.clone());
    let connector = SshConnector;

    match cli.cmd {
        Command::Ssh => commands::ssh(&store).await,
        Command::KagLogs => commands::kag_logs(&store, &connector).await,
        Command::Rcon => {
            let config = config::load(&cli.config_file)?;
            commands::rcon(&store, &config).await
        }
        Command::Up => {
            let config = config::load(&cli.config_file)?;
            let provider = provider_for(&config)?;
            let ctx = Context::new(provider.as_ref(), &connector, &store);
            commands::up(&ctx, &config).await.map(|_| ())
        }
        Command::Down { skip_cache } => {
            let config = config::load(&cli.config_file)?;
            let provider = provider_for(&config)?;
            let ctx = Context::new(provider.as_ref(), &connector, &store);
            commands::down(&ctx, &config, skip_cache).await.map(|_| ())
        }
        Command::RestartKag => {
            let config = config::load(&cli.config_file)?;
            let provider = provider_for(&config)?;
            let ctx = Context::new(provider.as_ref(), &connector, &store);
            commands::restart_kag(&ctx, &config).await
        }
    }
}

fn provider_for(config: &DesiredConfig) -> Result<Box<dyn CloudProvider>, KagError> {
    let provider_name = ProviderManager::current_provider_name();
    tracing::info!("[main] Using provider {}", provider_name);
    ProviderManager::get_provider(&provider_name, config)
}
