//! roster-server binary.
//!
//! Reads `config.toml` (or the path specified with `--config`), opens an
//! in-process SQLite store, serves the JSON API over HTTP, and reconciles
//! tracked-group membership in the background.
//!
//! # Token hash generation
//!
//! To generate the value for `api_token_sha256` in config.toml:
//!
//! ```
//! cargo run -p roster-server -- --hash-token
//! ```

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use clap::Parser;
use roster_api::ApiState;
use roster_core::{
  clock::{Clock, SystemClock},
  group::GroupRegistry,
  reconcile::Reconciler,
};
use roster_server::{ServerConfig, auth::hash_token, snapshot::HttpSnapshotSource};
use roster_store_sqlite::SqliteStore;
use tokio::{net::TcpListener, sync::broadcast};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Roster AFK and membership server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,

  /// Print the SHA-256 digest for a token entered on stdin and exit.
  #[arg(long)]
  hash_token: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Helper mode: hash a token and exit.
  if cli.hash_token {
    let token = read_token()?;
    println!("{}", hash_token(&token));
    return Ok(());
  }

  // Load configuration.
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("ROSTER").separator("__"))
    .build()
    .context("failed to read config file")?;

  let server_cfg: ServerConfig = settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;
  let policy = server_cfg.afk_policy()?;

  // Expand `~` in store path.
  let store_path = expand_tilde(&server_cfg.store_path);

  // Open SQLite store.
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?
    .with_timeout(server_cfg.store_timeout());
  let store = Arc::new(store);
  let clock: Arc<dyn Clock> = Arc::new(SystemClock);

  let state = ApiState::new(
    Arc::clone(&store),
    Arc::clone(&clock),
    policy,
    GroupRegistry::new(server_cfg.groups.clone()),
  );

  // Clear the `is_active` flag on windows that lapsed while we were down.
  match state.afk.sweep_expired().await {
    Ok(n) => tracing::info!(swept = n, "startup sweep of expired AFK entries"),
    Err(e) => tracing::warn!(error = %e, "startup sweep failed"),
  }

  // Start membership reconciliation.
  let (shutdown_tx, _) = broadcast::channel(1);
  let reconciler = match &server_cfg.snapshot {
    Some(snapshot_cfg) if !server_cfg.groups.is_empty() => {
      let source = HttpSnapshotSource::new(snapshot_cfg)
        .context("failed to build snapshot source")?;
      let reconciler = Arc::new(
        Reconciler::new(Arc::clone(&store), Arc::new(source), Arc::clone(&clock))
          .with_interval(server_cfg.reconcile_interval()),
      );
      Some(tokio::spawn(
        reconciler.run(server_cfg.groups.clone(), shutdown_tx.subscribe()),
      ))
    }
    Some(_) => {
      tracing::warn!("snapshot source configured but no groups; reconciliation disabled");
      None
    }
    None => {
      tracing::warn!("no snapshot source configured; reconciliation disabled");
      None
    }
  };

  let app = roster_server::router(state, server_cfg.auth());
  let address = server_cfg.address();

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

  // Stop the reconciler between ticks and wait for it.
  let _ = shutdown_tx.send(());
  if let Some(handle) = reconciler {
    handle.await.context("reconciler task panicked")?;
  }

  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!(error = %e, "failed to listen for ctrl-c; serving until killed");
    std::future::pending::<()>().await;
  }
  tracing::info!("shutting down");
}

/// Read a token from stdin.
fn read_token() -> anyhow::Result<String> {
  use std::io::{self, BufRead, Write};
  let stdin = io::stdin();
  print!("Token: ");
  io::stdout().flush().ok();
  let mut line = String::new();
  stdin.lock().read_line(&mut line)?;
  let token = line.trim();
  anyhow::ensure!(!token.is_empty(), "token must not be empty");
  Ok(token.to_string())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
