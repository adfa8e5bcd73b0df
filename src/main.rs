use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::Term;
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dirdrop::client::{Client, ReceiveEvent};
use dirdrop::common::config::{self, apply_overrides, load_config};
use dirdrop::common::{AppConfig, CodecError, ConfigOverrides, SessionError};
use dirdrop::output;
use dirdrop::server::FileServer;

#[derive(Parser, Debug)]
#[command(name = "dirdrop")]
#[command(version, about = "Share a folder of text files over TCP")]
struct Cli {
    /// Config file to use instead of the platform default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the shared folder
    Serve {
        #[arg(long)]
        address: Option<String>,
        /// Folder to share
        #[arg(long)]
        folder: Option<PathBuf>,
        #[arg(long)]
        max_sessions: Option<usize>,
    },
    /// Connect to a server and fetch files interactively
    Fetch {
        #[arg(long)]
        address: Option<String>,
        /// Where received files are written
        #[arg(long)]
        download_dir: Option<PathBuf>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the config file location
    Path,
    /// Print the resolved configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Reads std::env::args(), exits with usage on anything clap rejects
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        Commands::Serve {
            address,
            folder,
            max_sessions,
        } => {
            // flags on the command line win over file and env
            let overrides = ConfigOverrides {
                server_address: address,
                folder,
                max_sessions,
                ..Default::default()
            };
            let config = apply_overrides(load_config(cli.config.as_deref())?, &overrides)?;
            serve(config).await
        }
        Commands::Fetch {
            address,
            download_dir,
        } => {
            let overrides = ConfigOverrides {
                client_address: address,
                download_dir,
                ..Default::default()
            };
            let config = apply_overrides(load_config(cli.config.as_deref())?, &overrides)?;
            fetch(config).await
        }
        Commands::Config { action } => match action {
            ConfigAction::Path => {
                let path = cli.config.unwrap_or_else(config::config_path);
                println!("{}", path.display());
                Ok(())
            }
            ConfigAction::Show => {
                let config = load_config(cli.config.as_deref())?;
                let rendered =
                    toml::to_string_pretty(&config).context("Failed to render configuration")?;
                print!("{rendered}");
                Ok(())
            }
        },
    }
}

fn init_logging(cli: &Cli) {
    // the fetch prompt shares the terminal, keep it quiet by default
    let default_filter = match (&cli.command, cli.verbose) {
        (_, true) => "debug",
        (Commands::Serve { .. }, false) => "info",
        _ => "warn",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(config: AppConfig) -> Result<()> {
    let server = FileServer::bind(&config.server, &config.transfer).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("Failed to listen for Ctrl+C");
            return;
        }
        // run() sees the token and stops accepting
        info!("Ctrl+C received - shutting down");
        signal_token.cancel();
    });

    server.run(shutdown).await;
    Ok(())
}

async fn fetch(config: AppConfig) -> Result<()> {
    let (mut client, mut events) = Client::connect(&config.client, &config.transfer).await?;
    let term = Term::stdout();
    term.write_line(&output::success(&format!(
        "Connected to {}",
        client.server_addr()
    )))?;

    loop {
        term.write_line(&output::hint("Commands: file, all, exit"))?;
        let Some(choice) = read_input("> ").await? else {
            break;
        };

        let sent = match choice.as_str() {
            "file" => {
                let Some(name) = read_input("File name: ").await? else {
                    break;
                };
                client.request_file(&name).await
            }
            "all" => client.request_all().await,
            "exit" => break,
            "" => continue,
            other => {
                term.write_line(&output::failure(&format!("Unknown command: {other}")))?;
                continue;
            }
        };

        // wait for the receive loop to finish before prompting again
        match sent {
            Ok(()) => {
                if !report_until_idle(&term, &mut events).await? {
                    break;
                }
            }
            Err(err @ SessionError::Transfer(_))
            | Err(err @ SessionError::Codec(CodecError::TokenTooLong { .. })) => {
                // refused before anything was sent, connection is fine
                term.write_line(&output::failure(&err.to_string()))?;
            }
            Err(err) => {
                client.close().await;
                return Err(err).context("Request failed");
            }
        }
    }

    client.close().await;
    Ok(())
}

/// Prints receive events until the request finishes. `false` once the server is gone.
async fn report_until_idle(
    term: &Term,
    events: &mut UnboundedReceiver<ReceiveEvent>,
) -> std::io::Result<bool> {
    while let Some(event) = events.recv().await {
        match event {
            ReceiveEvent::FileReceived { name, bytes } => {
                term.write_line(&output::success(&format!("{name} ({bytes} bytes)")))?
            }
            ReceiveEvent::NoData { name } => {
                term.write_line(&output::failure(&format!("{name}: no data received")))?
            }
            ReceiveEvent::FileFailed { name, error } => {
                term.write_line(&output::failure(&format!("{name}: {error}")))?
            }
            ReceiveEvent::Idle => return Ok(true),
            ReceiveEvent::Disconnected => {
                term.write_line(&output::failure("Server closed the connection"))?;
                return Ok(false);
            }
        }
    }
    Ok(false)
}

/// Reads one trimmed line from stdin. `None` at end of input.
async fn read_input(label: &'static str) -> Result<Option<String>> {
    // stdin is blocking, keep it off the runtime threads
    tokio::task::spawn_blocking(move || -> std::io::Result<Option<String>> {
        Term::stdout().write_str(label)?;
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    })
    .await
    .context("Input task failed")?
    .context("Failed to read input")
}
