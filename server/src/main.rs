use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ouiwatch_server::{api, config, coordinator::Coordinator, oui::OuiDatabase, refresh};
use std::process::ExitCode;
use tracing::info;

/// ouiwatch: MAC address vendor lookup backed by a self-refreshing OUI database.
#[derive(Parser, Debug)]
#[command(name = "ouiwatch-server", version, about)]
struct Cli {
    /// Address and port to listen on (overrides the config file).
    #[arg(short, long)]
    listen: Option<String>,

    /// Path to a TOML configuration file (optional).
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the lookup API (default).
    Serve,
    /// Resolve addresses against the local reference file and exit.
    Lookup {
        /// MAC addresses in any common notation.
        #[arg(required = true)]
        addresses: Vec<String>,
    },
    /// Download the reference file once and exit.
    Refresh,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing (logs).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ouiwatch_server=debug,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    // Load optional config file.
    let app_config = if let Some(ref path) = cli.config {
        config::AppConfig::from_file(path)?
    } else {
        config::AppConfig::default()
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let listen = cli.listen.unwrap_or(app_config.listen);
            serve(&app_config.refresh, &listen).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Lookup { addresses } => lookup(&app_config.refresh, &addresses).await,
        Command::Refresh => refresh_once(&app_config.refresh).await,
    }
}

async fn serve(refresh_config: &config::RefreshConfig, listen: &str) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting ouiwatch server"
    );

    let coordinator = Coordinator::from_config(refresh_config)?;
    coordinator
        .start()
        .await
        .context("initial reference refresh failed")?;

    let app = api::router(api::AppState::new(coordinator));

    // Start listening.
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(addr = %listen, "Listening");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn lookup(refresh_config: &config::RefreshConfig, addresses: &[String]) -> Result<ExitCode> {
    let database = OuiDatabase::new(&refresh_config.destination);
    database.rebuild().await.with_context(|| {
        format!(
            "cannot load {} (run `ouiwatch-server refresh` first)",
            refresh_config.destination.display()
        )
    })?;

    let mut all_found = true;
    for address in addresses {
        match database.lookup(address) {
            Some(hit) if hit.annotation.is_empty() => {
                println!("{address}\t{}\t{}", hit.prefix, hit.organization)
            }
            Some(hit) => println!(
                "{address}\t{}\t{}\t{}",
                hit.prefix, hit.organization, hit.annotation
            ),
            None => {
                all_found = false;
                println!("{address}\t-");
            }
        }
    }

    Ok(if all_found {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn refresh_once(refresh_config: &config::RefreshConfig) -> Result<ExitCode> {
    let scheduler = refresh::RefreshScheduler::new(refresh_config.settings()?)?;
    match scheduler.refresh_now().await {
        Ok(()) => {
            println!("{}", scheduler.destination().display());
            Ok(ExitCode::SUCCESS)
        }
        // Already logged with its stage.
        Err(_) => Ok(ExitCode::FAILURE),
    }
}
