use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tengine_callback::RecordingCallbackBridge;
use tengine_control_plane::{build_router, AppState};
use tengine_engine::{
    EngineConfig, EngineHandle, EngineService, RemoteAction, ServiceConfig, TracingNotifier,
    TransferEngine,
};
use tengine_plugins::{
    ManifestPluginLoader, PluginDirectoryWatcher, PluginInfoSource, PluginLoader, TransferPlugin,
};
use tengine_storage::{StorageConfig, TransferStore};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Transfer engine daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the engine and its HTTP control plane.
    Serve {
        #[arg(long, default_value = "config/tengine.toml")]
        config: PathBuf,
    },
    /// List the transfer methods found in the plugin directory.
    Plugins {
        #[arg(long, default_value = "config/tengine.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RuntimeConfig {
    storage: StorageSection,
    http: HttpSection,
    #[serde(default)]
    engine: EngineSection,
    #[serde(default)]
    plugins: PluginsSection,
    #[serde(default)]
    notifications: NotificationsSection,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageSection {
    sqlite_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpSection {
    bind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct EngineSection {
    activity_sweep_secs: u64,
    activity_expiry_secs: u64,
    plugin_debounce_secs: u64,
    idle_exit: bool,
    idle_exit_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            activity_sweep_secs: tengine_engine::DEFAULT_SWEEP_INTERVAL.as_secs(),
            activity_expiry_secs: tengine_engine::DEFAULT_ACTIVITY_EXPIRY.as_secs(),
            plugin_debounce_secs: tengine_plugins::DEFAULT_RESCAN_DEBOUNCE.as_secs(),
            idle_exit: false,
            idle_exit_secs: tengine_engine::DEFAULT_IDLE_EXIT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct PluginsSection {
    directory: PathBuf,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("plugins"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct NotificationsSection {
    enabled: bool,
    action: Option<RemoteAction>,
}

impl Default for NotificationsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            action: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(load_config(&config)?).await,
        Command::Plugins { config } => list_plugins(load_config(&config)?),
    }
}

fn load_config(config_path: &Path) -> Result<RuntimeConfig> {
    let config_source = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config file {}", config_path.display()))?;
    toml::from_str(&config_source)
        .with_context(|| format!("invalid config TOML at {}", config_path.display()))
}

fn list_plugins(config: RuntimeConfig) -> Result<()> {
    let loader = ManifestPluginLoader::new(&config.plugins.directory);
    let plugins = loader.load().context("failed to load plugin manifests")?;
    for plugin in plugins {
        let status = if plugin.enabled() { "enabled" } else { "disabled" };
        for descriptor in plugin.info_source().info() {
            println!(
                "{}\t{}\t{}\t{}",
                descriptor.id,
                status,
                descriptor.display_name,
                descriptor.capabilities.join(",")
            );
        }
    }
    Ok(())
}

async fn serve(config: RuntimeConfig) -> Result<()> {
    let store = TransferStore::connect(&StorageConfig {
        sqlite_path: config.storage.sqlite_path.clone(),
    })
    .await?;

    let loader = Arc::new(ManifestPluginLoader::new(&config.plugins.directory));
    let engine_config = EngineConfig {
        activity_expiry: Duration::from_secs(config.engine.activity_expiry_secs),
        plugin_debounce: Duration::from_secs(config.engine.plugin_debounce_secs),
        notifications_enabled: config.notifications.enabled,
        group_action: config.notifications.action.clone().filter(|action| !action.is_empty()),
    };
    let (engine, channels) = TransferEngine::new(
        store,
        loader,
        Arc::new(RecordingCallbackBridge::default()),
        Arc::new(TracingNotifier),
        engine_config,
    );
    let (handle, engine_task) = EngineService::spawn(
        engine,
        channels,
        ServiceConfig {
            sweep_interval: Duration::from_secs(config.engine.activity_sweep_secs),
            idle_exit: config
                .engine
                .idle_exit
                .then(|| Duration::from_secs(config.engine.idle_exit_secs)),
        },
    );

    let watch_handle = handle.clone();
    let _watcher = match PluginDirectoryWatcher::start(&config.plugins.directory, move || {
        watch_handle.plugins_changed()
    }) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(directory = %config.plugins.directory.display(), error = %err, "plugin directory is not watched");
            None
        }
    };

    spawn_signal_handlers(handle.clone());

    if !is_loopback(&config.http.bind) {
        warn!(bind = %config.http.bind, "control plane exposed beyond loopback without authentication");
    }

    let app = build_router(AppState::new(handle));
    let socket: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid socket address {}", config.http.bind))?;
    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;

    info!(bind = %config.http.bind, "tengined control plane listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = engine_task.await {
                error!(error = %err, "engine task ended abnormally");
            }
        })
        .await
        .context("axum server failed")
}

fn spawn_signal_handlers(handle: EngineHandle) {
    #[cfg(unix)]
    {
        let idle_handle = handle.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut usr1 = match signal(SignalKind::user_defined1()) {
                Ok(usr1) => usr1,
                Err(err) => {
                    warn!(error = %err, "cannot listen for SIGUSR1");
                    return;
                }
            };
            while usr1.recv().await.is_some() {
                info!("SIGUSR1 received, exiting if idle");
                idle_handle.exit_if_idle().await;
            }
        });
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                handle.shutdown().await;
            }
            Err(err) => error!(error = %err, "cannot listen for ctrl-c"),
        }
    });
}

fn is_loopback(bind: &str) -> bool {
    bind.parse::<SocketAddr>()
        .map(|addr| addr.ip().is_loopback())
        .unwrap_or(false)
}
