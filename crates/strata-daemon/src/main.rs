use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;

use strata_config::logging::{init_logging, LogLevel};
use strata_config::{log_daemon_info, Config};
use strata_core::Subscriber;
use strata_ipc::client::DaemonClient;
use strata_origin::HttpOrigin;

mod server;

#[derive(Parser)]
#[command(name = "strata")]
#[command(version, about = "strata subscriber cache daemon", long_about = None)]
struct Cli {
    /// Config file layered over ~/.strata/config.toml
    #[arg(long, global = true, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Daemon socket (overrides config)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Start,
    /// Print the default configuration
    InitConfig,
    /// Cache and daemon status
    Status,
    /// Configured and subscribed roots
    Roots,
    /// Subscribe to a root
    Subscribe { root: String },
    /// Drop a root subscription
    Unsubscribe { root: String },
    /// Dataset paths of a subscribed root
    Datasets { root: String },
    /// Mark a root's listing as changed
    Notify { root: String },
    /// Dataset metadata as JSON
    Info { root: String, path: String },
    /// Fetch a whole dataset into a file
    Download {
        root: String,
        path: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Remove cached data of datasets deleted at the origin
    Purge { root: String },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let global = Config::global_config_path();
            let mut config = Config::load_layers(global.as_deref(), Some(path))
                .with_context(|| format!("Failed to load config {:?}", path))?;
            config.apply_env_overrides();
            config
        }
        None => Config::load().context("Failed to load config")?,
    };
    if let Some(socket) = &cli.socket {
        config.daemon.socket = socket.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    });

    let config = load_config(&cli)?;
    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => start_daemon(config).await,
        Commands::InitConfig => {
            print!("{}", Config::default_toml()?);
            Ok(())
        }
        command => run_client(&config, command).await,
    }
}

async fn start_daemon(config: Config) -> Result<()> {
    log_daemon_info!(
        "Starting daemon",
        cache_root = tracing::field::debug(config.storage.cache_root()),
        origins = config.origins.len(),
    );

    let origin = HttpOrigin::new(&config.origins, config.fetch.timeout())
        .context("Failed to build origin client")?;
    let subscriber = Subscriber::open(&config, Arc::new(origin))?;

    let poller = server::spawn_poller(subscriber.clone(), config.roots.poll_interval());

    let socket_path = config.daemon.socket.clone();
    let listener = server::bind(&socket_path).await?;
    server::serve(listener, subscriber.clone(), async {
        let _ = signal::ctrl_c().await;
    })
    .await;

    if let Some(poller) = poller {
        poller.abort();
    }
    subscriber.meta().sync()?;
    if socket_path.exists() {
        tokio::fs::remove_file(&socket_path).await?;
    }
    log_daemon_info!("Shut down");
    Ok(())
}

async fn run_client(config: &Config, command: Commands) -> Result<()> {
    let mut client = DaemonClient::connect_to(&config.daemon.socket)
        .await
        .with_context(|| {
            format!(
                "Cannot reach daemon at {:?} (is `strata start` running?)",
                config.daemon.socket
            )
        })?;

    match command {
        Commands::Status => {
            let status = client.status().await?;
            println!("Datasets:         {}", status.datasets);
            println!("Chunks:           {}", status.chunks);
            println!("Bytes:            {}", status.bytes);
            println!("Subscribed roots: {}", status.subscribed_roots);
            println!("In-flight:        {}", status.in_flight);
        }
        Commands::Roots => {
            for root in client.list_roots().await? {
                let mark = if root.subscribed { "*" } else { " " };
                println!("{} {} ({:?})", mark, root.name, root.scope);
            }
        }
        Commands::Subscribe { root } => {
            client.subscribe(&root).await?;
            println!("Subscribed to {}", root);
        }
        Commands::Unsubscribe { root } => {
            if client.unsubscribe(&root).await? {
                println!("Unsubscribed from {}", root);
            } else {
                println!("{} was not subscribed", root);
            }
        }
        Commands::Datasets { root } => {
            for path in client.list_datasets(&root).await? {
                println!("{}", path);
            }
        }
        Commands::Notify { root } => {
            if !client.notify(&root).await? {
                anyhow::bail!("Unknown root {}", root);
            }
        }
        Commands::Info { root, path } => {
            let meta = client.info(&root, &path).await?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Commands::Download { root, path, output } => {
            let bytes = client.download(&root, &path).await?;
            tokio::fs::write(&output, &bytes)
                .await
                .with_context(|| format!("Failed to write {:?}", output))?;
            println!("Wrote {} bytes to {:?}", bytes.len(), output);
        }
        Commands::Purge { root } => {
            for path in client.purge_deleted(&root).await? {
                println!("Purged {}", path);
            }
        }
        Commands::Start | Commands::InitConfig => anyhow::bail!("Not a client command"),
    }
    Ok(())
}
