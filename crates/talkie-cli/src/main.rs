use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;

use talkie_bus::config::{config_path, load_config, settings_db_path};
use talkie_bus::transport::PortHub;
use talkie_bus::{
    listener_fn, Background, Broadcaster, ContextKind, Foreground, MemoryStorage, NullSpeech,
    SettingsManager, SqliteStorage,
};
use talkie_types::config::TalkieConfig;
use talkie_types::{KnownAction, KnownEvent};

#[derive(Parser)]
#[command(name = "talkie", version, about = "Talkie message bus")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration
    Status,
    /// Read or write stored settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    /// Run a background and a popup context in-process and exchange a few messages
    Demo,
    /// Serve the message bus on a Unix socket until interrupted
    Serve {
        #[arg(long)]
        socket: PathBuf,
    },
    /// Send one request to a served message bus
    Call {
        #[arg(long)]
        socket: PathBuf,
        /// Action name, e.g. getSetting
        action: KnownAction,
        /// JSON data for the action
        data: Option<String>,
    },
}

#[derive(Subcommand)]
enum SettingsCommand {
    Get { key: String },
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Status => {
            println!("Talkie v{}", env!("CARGO_PKG_VERSION"));
            println!("Port: {}", cfg.bus.port_name);
            println!(
                "Retry: {} attempts, {}ms apart",
                cfg.bus.retry_attempts, cfg.bus.retry_delay_ms
            );
            println!("Request timeout: {}ms", cfg.bus.request_timeout_ms);
            println!(
                "Liveness: probe {}, {} dead-object signatures",
                if cfg.liveness.probe_contexts { "on" } else { "off" },
                cfg.liveness.dead_object_signatures.len()
            );
            println!("Config: {}", config_path().display());
            println!("Settings: {}", settings_db_path(&cfg).display());
            Ok(())
        }
        Commands::Settings { command } => settings(&cfg, command).await,
        Commands::Demo => demo(&cfg).await,
        Commands::Serve { socket } => serve(&cfg, socket).await,
        Commands::Call {
            socket,
            action,
            data,
        } => call(&cfg, socket, action, data).await,
    }
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("Not valid JSON: {raw}"))
}

fn open_settings_db(cfg: &TalkieConfig) -> Result<SqliteStorage> {
    let path = settings_db_path(cfg);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    SqliteStorage::open(&path)
}

async fn settings(cfg: &TalkieConfig, command: SettingsCommand) -> Result<()> {
    let manager = SettingsManager::new(Arc::new(open_settings_db(cfg)?), Broadcaster::default());
    match command {
        SettingsCommand::Get { key } => {
            match manager.get_stored_value(&key).await? {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => println!("{key} is not set"),
            }
        }
        SettingsCommand::Set { key, value } => {
            let value = parse_json(&value)?;
            let changed = manager.set_stored_value(&key, &value).await?;
            println!("{key} = {value}{}", if changed { "" } else { " (unchanged)" });
        }
    }
    Ok(())
}

async fn demo(cfg: &TalkieConfig) -> Result<()> {
    let hub = PortHub::new();
    let background = Background::new(cfg, Arc::new(MemoryStorage::new()), Arc::new(NullSpeech));
    background.start(hub.listen(&cfg.bus.port_name)?).await?;

    for event in [
        KnownEvent::BeforeSpeaking,
        KnownEvent::AfterSpeaking,
        KnownEvent::SettingChanged,
    ] {
        background.broadcaster().register(
            background.context().handle(),
            event,
            listener_fn(|event, payload| async move {
                println!("  [{event}] {payload}");
                Ok(None)
            }),
        );
    }

    let popup = Foreground::new(ContextKind::Popup, Arc::new(hub.clone()), cfg);
    popup.broadcaster().register(
        popup.context().handle(),
        KnownEvent::SettingChanged,
        listener_fn(|_, payload| async move {
            println!("  [popup heard settingChanged] {payload}");
            Ok(None)
        }),
    );
    popup.attach().await?;
    println!("Background v{}", popup.metadata.version().await?);
    let platform = popup.metadata.platform().await?;
    println!("Platform: {} / {}", platform.os, platform.arch);

    println!("Speaking:");
    popup.speaking.start_speaking("Hello from the popup.", None).await?;

    println!("Settings:");
    popup.settings.set_setting("speakRate", json!(1.25)).await?;
    popup.settings.set_setting("speakRate", json!(1.25)).await?;
    popup.settings.set_setting("speakRate", json!(1.5)).await?;
    println!(
        "speakRate is now {}",
        popup.settings.get_setting("speakRate").await?.unwrap_or(Value::Null)
    );

    popup.detach().await?;
    background.stop().await?;
    Ok(())
}

#[cfg(unix)]
async fn serve(cfg: &TalkieConfig, socket: PathBuf) -> Result<()> {
    use talkie_bus::transport::stream::UnixAcceptor;

    let storage = open_settings_db(cfg)?;
    let background = Background::new(cfg, Arc::new(storage), Arc::new(NullSpeech));
    let acceptor = UnixAcceptor::bind(&socket)
        .with_context(|| format!("Failed to listen on {}", socket.display()))?;
    background.start(acceptor).await?;
    info!("Serving {} on {}", cfg.bus.port_name, socket.display());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    background.stop().await?;
    if let Err(e) = std::fs::remove_file(&socket) {
        info!("Could not remove {}: {}", socket.display(), e);
    }
    Ok(())
}

#[cfg(unix)]
async fn call(
    cfg: &TalkieConfig,
    socket: PathBuf,
    action: KnownAction,
    data: Option<String>,
) -> Result<()> {
    use talkie_bus::transport::stream::UnixConnector;
    use talkie_bus::MessageBusGroundwork;

    let data = match data {
        Some(raw) => parse_json(&raw)?,
        None => Value::Null,
    };
    let bus = MessageBusGroundwork::from_config(Arc::new(UnixConnector::new(socket)), &cfg.bus);
    let response: Value = bus
        .bespeak(action, &data)
        .await
        .with_context(|| format!("{action} failed"))?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

#[cfg(not(unix))]
async fn serve(_cfg: &TalkieConfig, _socket: PathBuf) -> Result<()> {
    anyhow::bail!("serve needs Unix domain sockets")
}

#[cfg(not(unix))]
async fn call(
    _cfg: &TalkieConfig,
    _socket: PathBuf,
    _action: KnownAction,
    _data: Option<String>,
) -> Result<()> {
    anyhow::bail!("call needs Unix domain sockets")
}
