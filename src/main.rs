//! tabctl - session-multiplexed browser tab control
//!
//! **Server mode** (`tabctl serve`): listens on a loopback port and speaks a
//! JSON command protocol over WebSocket. Connections are grouped into
//! sessions; each session owns its own tabs.
//!
//! **Session bootstrap** (`tabctl session new|ensure`): creates (or reuses) a
//! session id for shell scripts that reconnect across commands.

use clap::{Parser as ClapParser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tabctl::{
    browser::MemoryBrowser,
    client,
    config::{self, ConfigError, ServerConfig},
    handlers::builtin_handlers,
    server::Server,
};

/// tabctl - session-multiplexed browser tab control
#[derive(ClapParser, Debug)]
#[command(name = "tabctl", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the command server until Ctrl+C
    Serve {
        /// Address to bind (loopback only); overrides the config file
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Config file (default: <config dir>/tabctl/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Session bootstrap for scripts
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand, Debug)]
enum SessionAction {
    /// Create a new session and print its id
    New {
        /// Print as a shell `export` statement
        #[arg(long)]
        shell: bool,

        /// Server URL
        #[arg(long, env = "TABCTL_WS_URL", default_value = client::DEFAULT_WS_URL)]
        ws_url: String,
    },
    /// Print the pinned session id, creating a session if none is pinned or it is gone
    Ensure {
        /// Print as a shell `export` statement
        #[arg(long)]
        shell: bool,

        /// Server URL
        #[arg(long, env = "TABCTL_WS_URL", default_value = client::DEFAULT_WS_URL)]
        ws_url: String,

        /// Pinned session id
        #[arg(long, env = "TABCTL_SESSION_ID")]
        session: Option<String>,
    },
}

#[derive(Debug, Error)]
enum TabctlError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0:#}")]
    Client(#[from] anyhow::Error),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), TabctlError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve { bind, config } => run_server(bind, config).await,
        Commands::Session { action } => run_session(action).await,
    }
}

fn init_tracing() {
    // stdout is reserved for command output (session ids).
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tabctl=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_server(bind: Option<SocketAddr>, config_path: Option<PathBuf>) -> Result<(), TabctlError> {
    let path = config_path.or_else(config::default_config_path);
    let mut config = ServerConfig::load(path.as_deref())?;
    if let Some(bind) = bind {
        config.bind = bind;
        config.validate()?;
    }

    let browser = Arc::new(MemoryBrowser::new());
    let server = Server::bind(&config, browser, builtin_handlers()).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(?e, "failed to listen for Ctrl+C");
    } else {
        tracing::info!("received Ctrl+C");
    }

    server.stop().await;
    Ok(())
}

async fn run_session(action: SessionAction) -> Result<(), TabctlError> {
    let (id, shell) = match action {
        SessionAction::New { shell, ws_url } => (client::create_session(&ws_url).await?, shell),
        SessionAction::Ensure {
            shell,
            ws_url,
            session,
        } => (client::ensure_session(session, &ws_url).await?, shell),
    };
    if shell {
        println!("{}", client::shell_export(&id));
    } else {
        println!("{id}");
    }
    Ok(())
}
