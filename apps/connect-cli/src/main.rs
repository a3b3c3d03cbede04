//! connect-cli: an interactive terminal front-end for the Spotify Connect
//! engine in `connect-core`. A thin host: it supplies device config,
//! credentials, and stub implementations of the out-of-scope capability
//! traits, then drives the engine from a line-oriented
//! command loop and prints event stream updates as they arrive.

mod config;
mod host;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use connect_core::session::{Credentials, DeviceConfig};
use connect_core::{
    bootstrap_engine, BootstrappedEngine, ConnectionEvent, EngineEvent, HostDependencies, PlaybackEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

use crate::config::CliConfig;
use crate::host::{NullApTransport, NullClusterUpdateDecoder, StaticTokenRefresher};

/// connect-cli - interactive terminal front-end for an unofficial Spotify
/// Connect client engine.
#[derive(Parser, Debug)]
#[command(name = "connect-cli")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "CONNECT_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Override the credentials file path from the config.
    #[arg(long, env = "CONNECT_CREDENTIALS_PATH")]
    credentials_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("connect-cli v{}", env!("CARGO_PKG_VERSION"));

    let mut config = CliConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(path) = args.credentials_path {
        config.credentials_path = Some(path);
    }

    let credentials = load_credentials(config.credentials_path.as_deref())
        .context("failed to load credentials")?;

    let device = DeviceConfig {
        device_id: config.device_id.clone(),
        device_name: config.device_name.clone(),
        device_type: config.device_type.clone(),
    };

    let deps = HostDependencies {
        device,
        credentials,
        token_refresher: Arc::new(StaticTokenRefresher),
        ap_transport: Arc::new(NullApTransport),
        cluster_update_decoder: Arc::new(NullClusterUpdateDecoder),
        decoder: None,
        dealer_resolver: None,
        spclient_host: config.spclient_host.clone(),
    };

    let engine = bootstrap_engine(config.to_engine_config(), deps).context("failed to bootstrap engine")?;
    engine.start();
    log::info!("engine started as device {:?} ({})", config.device_name, config.device_id);

    let events_task = spawn_event_printer(&engine);
    print_help();

    tokio::select! {
        result = run_command_loop(engine.clone()) => result?,
        _ = shutdown_signal() => {
            log::info!("shutdown signal received");
        }
    }

    events_task.abort();
    engine.shutdown();
    engine.session.dispose().await;
    log::info!("shutdown complete");
    Ok(())
}

/// Reads a credentials blob from `path`. A line prefixed `access_token:` is
/// treated as a directly-supplied access token (the only case this CLI's
/// [`host::StaticTokenRefresher`] can actually refresh); anything else is
/// passed through as an opaque reusable blob for a richer host to exchange.
fn load_credentials(path: Option<&std::path::Path>) -> Result<Credentials> {
    let Some(path) = path else {
        anyhow::bail!(
            "no credentials_path configured; set it in the config file or \
             CONNECT_CREDENTIALS_PATH"
        );
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read credentials file: {}", path.display()))?;
    let trimmed = content.trim();
    if let Some(token) = trimmed.strip_prefix("access_token:") {
        Ok(Credentials::AccessToken {
            token: token.trim().to_string(),
            expires_in: std::time::Duration::from_secs(3600),
        })
    } else {
        Ok(Credentials::Reusable(trimmed.as_bytes().to_vec()))
    }
}

fn spawn_event_printer(engine: &BootstrappedEngine) -> tokio::task::JoinHandle<()> {
    let mut rx = engine.events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(EngineEvent::Connection(ConnectionEvent::StateChanged(state))) => {
                    println!("[connection] {state:?}");
                }
                Ok(EngineEvent::Connection(ConnectionEvent::ReconnectScheduled { attempt, delay_ms })) => {
                    println!("[connection] reconnecting (attempt {attempt}, in {delay_ms}ms)");
                }
                Ok(EngineEvent::Playback(PlaybackEvent::LocalStateChanged { track_uri, position_ms, status })) => {
                    println!("[playback] {status:?} {track_uri} @ {position_ms}ms");
                }
                Ok(EngineEvent::Playback(PlaybackEvent::RemoteTrackChanged { track_uri })) => {
                    println!("[remote] track changed: {track_uri}");
                }
                Ok(EngineEvent::Playback(_)) => {}
                Ok(EngineEvent::Download(event)) => {
                    println!("[download] {} (retry {} will_retry={})", event.message, event.retry_count, event.will_retry);
                }
                Ok(EngineEvent::ConnectState(event)) => {
                    log::debug!("connect-state event: {event:?}");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("event printer lagged, dropped {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn print_help() {
    println!("connect-cli ready. Commands:");
    println!("  play <uri>         load and play a spotify:track:... or spotify:episode:... uri");
    println!("  pause              pause playback");
    println!("  resume             resume playback");
    println!("  next               skip to the next track");
    println!("  prev               skip to the previous track");
    println!("  seek <sec>         seek to an absolute position, in seconds");
    println!("  vol [0-100|+|-]    show, set, or nudge the device volume");
    println!("  device on|off      mark this device active/inactive in the cluster");
    println!("  quit               exit");
}

/// Reads commands from stdin until `quit` or EOF.
async fn run_command_loop(engine: BootstrappedEngine) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        use std::io::Write;
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await? else {
            break;
        };
        if !dispatch_command(&engine, line.trim()).await {
            break;
        }
    }
    Ok(())
}

/// Executes one command line. Returns `false` on `quit`.
async fn dispatch_command(engine: &BootstrappedEngine, line: &str) -> bool {
    let mut parts = line.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or("").to_lowercase();
    let rest = parts.next().unwrap_or("").trim();

    match cmd.as_str() {
        "" => {}
        "play" => {
            if rest.is_empty() {
                println!("usage: play <uri>");
            } else {
                engine.pipeline.play(rest.to_string());
            }
        }
        "pause" => engine.pipeline.pause(),
        "resume" => engine.pipeline.resume(),
        "next" => engine.pipeline.skip_next(),
        "prev" => engine.pipeline.skip_prev(),
        "seek" => match rest.parse::<f64>() {
            Ok(seconds) => engine.pipeline.seek((seconds * 1000.0).round() as u64),
            Err(_) => println!("usage: seek <sec>"),
        },
        "vol" => handle_volume(engine, rest).await,
        "device" => match rest {
            "on" => engine.connect_state.set_active(true).await,
            "off" => engine.connect_state.set_active(false).await,
            _ => println!("usage: device on|off"),
        },
        "quit" | "exit" => return false,
        other => println!("unknown command: {other:?} (type a blank line for no-op)"),
    }
    true
}

async fn handle_volume(engine: &BootstrappedEngine, arg: &str) {
    let current = *engine.connect_state.volume().borrow();
    let current_percent = ((current as u32) * 100 / u16::MAX as u32) as i32;

    let target_percent = match arg {
        "" => {
            println!("volume: {current_percent}%");
            return;
        }
        "+" => (current_percent + 5).min(100),
        "-" => (current_percent - 5).max(0),
        other => match other.parse::<i32>() {
            Ok(v) => v.clamp(0, 100),
            Err(_) => {
                println!("usage: vol [0-100|+|-]");
                return;
            }
        },
    };

    engine.connect_state.set_volume_percent(target_percent as u8).await;
    println!("volume: {target_percent}%");
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
