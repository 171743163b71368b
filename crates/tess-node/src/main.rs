use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use tess_core::{Board, BoardConfig, Clock, SystemClock};
use tess_storage::{CanvasStorage, FjallCanvasStorage, LogCompactionTask, MemCanvasStorage};
use tess_types::Color;

const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

#[derive(clap::Parser, Debug)]
#[command(name = "tess-node", about = "Tessera shared canvas server")]
struct Cli {
    #[arg(long, default_value = "0.0.0.0:17100")]
    listen_addr: String,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `storage.data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct CanvasConfig {
    size: u32,
    cooldown_secs: u64,
    palette: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum StorageBackend {
    Memory,
    Fjall,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    backend: StorageBackend,
    data_dir: PathBuf,
    max_log_entries: u64,
    compaction_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
struct FeedConfig {
    tail_capacity: usize,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    session_buffer: usize,
}

#[derive(Debug, Deserialize)]
struct AdmissionConfig {
    prune_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    canvas: CanvasConfig,
    storage: StorageConfig,
    feed: FeedConfig,
    server: ServerConfig,
    admission: AdmissionConfig,
    observability: ObservabilityConfig,
}

impl Config {
    fn board(&self) -> anyhow::Result<BoardConfig> {
        let palette = self
            .canvas
            .palette
            .iter()
            .map(|raw| raw.parse::<Color>())
            .collect::<Result<Vec<_>, _>>()
            .context("invalid canvas.palette")?;
        Ok(BoardConfig {
            size: self.canvas.size,
            cooldown: Duration::from_secs(self.canvas.cooldown_secs),
            palette,
            tail_capacity: self.feed.tail_capacity,
        })
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut figment = Figment::new().merge(Toml::string(DEFAULT_CONFIG));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let mut config: Config = figment
        .merge(Env::prefixed("TESSERA_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    if let Some(ref dir) = cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    Ok(config)
}

fn init_tracing(observability: &ObservabilityConfig) {
    match observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&observability.log_level)
                .init();
        }
    }
}

async fn run<S: CanvasStorage>(
    storage: Arc<S>,
    config: &Config,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let board = Arc::new(
        Board::open(storage.clone(), config.board()?, clock.clone())
            .await
            .context("failed to open canvas")?,
    );

    let compaction = tokio::spawn(
        LogCompactionTask::new(
            storage,
            config.storage.max_log_entries,
            Duration::from_secs(config.storage.compaction_interval_secs.max(1)),
        )
        .with_ceiling(board.canvas().feed().watch_head())
        .run(),
    );
    let pruner = tokio::spawn(board.admission().clone().run_pruner(
        clock,
        Duration::from_secs(config.admission.prune_interval_secs.max(1)),
    ));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
    };
    let served = tess_server::serve(addr, board, config.server.session_buffer, shutdown).await;

    compaction.abort();
    pruner.abort();
    served
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.observability);

    let addr: SocketAddr = cli
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr: {}", cli.listen_addr))?;

    tracing::info!(
        listen_addr = %addr,
        backend = ?config.storage.backend,
        data_dir = %config.storage.data_dir.display(),
        "node starting"
    );

    match config.storage.backend {
        StorageBackend::Memory => run(Arc::new(MemCanvasStorage::new()), &config, addr).await,
        StorageBackend::Fjall => {
            std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
                format!("failed to create data dir {}", config.storage.data_dir.display())
            })?;
            let storage = FjallCanvasStorage::open(&config.storage.data_dir)
                .context("failed to open fjall storage")?;
            run(Arc::new(storage), &config, addr).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(config: Option<PathBuf>, data_dir: Option<PathBuf>) -> Cli {
        Cli { listen_addr: "127.0.0.1:0".into(), config, data_dir }
    }

    #[test]
    fn default_config_matches_board_defaults() {
        let config = load_config(&cli(None, None)).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Fjall);
        let board = config.board().unwrap();
        assert_eq!(board.size, 50);
        assert_eq!(board.cooldown, Duration::from_secs(300));
        assert_eq!(board.palette, BoardConfig::default_palette());
    }

    #[test]
    fn file_and_cli_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessera.toml");
        std::fs::write(
            &path,
            "[canvas]\ncooldown_secs = 60\npalette = []\n\n[storage]\nbackend = \"memory\"\n",
        )
        .unwrap();

        let config = load_config(&cli(Some(path), Some("/tmp/elsewhere".into()))).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/elsewhere"));
        let board = config.board().unwrap();
        assert_eq!(board.cooldown, Duration::from_secs(60));
        assert!(board.palette.is_empty());
        assert_eq!(board.size, 50);
    }

    #[test]
    fn bad_palette_entry_is_rejected() {
        let mut config = load_config(&cli(None, None)).unwrap();
        config.canvas.palette.push("chartreuse".into());
        assert!(config.board().is_err());
    }
}
