//! packlink - developer tool for the dev packager control channel
//!
//! Plays the app's side of the packager connection from a terminal: check
//! whether the packager is up, listen for reload / dev-menu commands and
//! content changes, or send a single request.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use packlink_client::handlers::FileIoHandler;
use packlink_client::{
    check_packager_status, http_client, ChangePoller, ConnectionEvent, ConnectionState,
    DevServerEndpoints, PackagerConnection, PackagerMethod,
};
use packlink_core::config::{init_config_dir, load_settings, save_settings};
use packlink_core::{logging, Settings};

/// How long `request` waits for the initial connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// packlink - talk to a running development packager
#[derive(Parser, Debug)]
#[command(name = "packlink")]
#[command(about = "Talk to a running development packager", long_about = None)]
struct Args {
    /// Project directory holding .packlink/config.toml
    #[arg(long, value_name = "DIR", global = true)]
    project: Option<PathBuf>,

    /// Development server host:port (overrides the config file)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Client id reported to the packager
    #[arg(long, default_value = "packlink", global = true)]
    client_id: String,

    /// Log to stderr instead of the log file
    #[arg(long, global = true)]
    log_stderr: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check whether the packager is running
    Status,
    /// Stay connected: log commands, serve file I/O and watch for changes
    Listen,
    /// Send one request and print its result
    Request {
        /// Method name, e.g. captureHeap
        method: String,
        /// JSON params
        params: Option<String>,
        /// Response timeout (defaults to the configured request timeout)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Write a default .packlink/config.toml (persisting --host if given)
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    if args.log_stderr {
        logging::init_stderr();
    } else {
        logging::init().wrap_err("failed to initialize logging")?;
    }

    let project = args
        .project
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut settings = load_settings(&project);
    if let Some(host) = &args.host {
        settings.server.host = host.clone();
    }
    let endpoints = DevServerEndpoints::from_settings(&settings.server);

    match args.command {
        Command::Status => status(&settings, &endpoints).await,
        Command::Listen => listen(&settings, &endpoints, &args.client_id, &project).await,
        Command::Request {
            method,
            params,
            timeout_secs,
        } => {
            let params = params
                .map(|p| serde_json::from_str::<Value>(&p))
                .transpose()
                .wrap_err("params must be valid JSON")?;
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| settings.connection.request_timeout());
            request(&settings, &endpoints, &args.client_id, &method, params, timeout).await
        }
        Command::Init => {
            init_config_dir(&project)?;
            if args.host.is_some() {
                save_settings(&project, &settings)?;
            }
            eprintln!("Config written to {}", project.join(".packlink").display());
            Ok(())
        }
    }
}

async fn status(settings: &Settings, endpoints: &DevServerEndpoints) -> Result<()> {
    let client = http_client(&settings.polling)?;
    let status = check_packager_status(&client, &endpoints.status_url()?).await;

    if status.is_running() {
        println!("Packager is running at {}", endpoints.host());
        Ok(())
    } else {
        Err(eyre!(
            "Cannot reach the development server at {}",
            endpoints.host()
        ))
    }
}

async fn listen(
    settings: &Settings,
    endpoints: &DevServerEndpoints,
    client_id: &str,
    project: &Path,
) -> Result<()> {
    let connection = PackagerConnection::from_settings(&settings.connection);

    connection.register_notification_handler(
        PackagerMethod::Reload,
        |_: Option<Value>| -> packlink_core::Result<()> {
            info!("Packager requested a bundle reload");
            println!("reload");
            Ok(())
        },
    );
    connection.register_notification_handler(
        PackagerMethod::DevMenu,
        |_: Option<Value>| -> packlink_core::Result<()> {
            info!("Packager requested the dev menu");
            println!("devMenu");
            Ok(())
        },
    );
    Arc::new(FileIoHandler::new(project)).register(&connection);

    let mut events = connection.subscribe();
    connection.open(&endpoints.packager_connection_url()?, client_id);

    let poller = ChangePoller::from_settings(endpoints.on_change_url()?, &settings.polling)?;
    poller.start(|| {
        info!("Development server content changed");
        println!("change");
    });

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupted, closing connection");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(ConnectionEvent::Connected) => eprintln!("Connected to {}", endpoints.host()),
                Ok(ConnectionEvent::Disconnected) => eprintln!("Disconnected"),
                Ok(ConnectionEvent::Reconnecting { attempt, max_attempts }) => {
                    debug!("Reconnecting ({}/{})", attempt, max_attempts);
                }
                Ok(ConnectionEvent::PermanentlyDisconnected { reason }) => {
                    break Err(eyre!(reason));
                }
                Err(RecvError::Lagged(missed)) => warn!("Missed {} connection events", missed),
                Err(RecvError::Closed) => break Ok(()),
            }
        }
    };

    poller.stop();
    connection.close().await;
    outcome
}

async fn request(
    settings: &Settings,
    endpoints: &DevServerEndpoints,
    client_id: &str,
    method: &str,
    params: Option<Value>,
    timeout: Duration,
) -> Result<()> {
    let connection = PackagerConnection::from_settings(&settings.connection);
    connection.open(&endpoints.packager_connection_url()?, client_id);

    let outcome = async {
        connection
            .wait_for_state(ConnectionState::Connected, CONNECT_TIMEOUT)
            .await
            .wrap_err_with(|| format!("could not connect to {}", endpoints.host()))?;
        let result = connection.send_request(method, params, timeout).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        Ok(())
    }
    .await;

    connection.close().await;
    outcome
}
