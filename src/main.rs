//! speak-rs: speak the current selection aloud on Linux.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use speak_rs::backend::VoiceParams;
use speak_rs::config::{BackendMode, Config, VoiceConfig};
use speak_rs::daemon::engine::render_to_wav;
use speak_rs::daemon::{run_daemon, DaemonClient, DaemonOptions, KokoroEngine, SpeechModel};
use speak_rs::paths::{self, RuntimePaths};
use speak_rs::playback::{status, worker};
use speak_rs::service::{self, AppRuntime};

#[derive(Parser, Debug)]
#[command(name = "speak-rs", about = "Speak the current selection aloud")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the host service (default)
    Run,
    /// Synthesize and play one text snapshot (spawned by the host)
    Speak {
        #[arg(long, value_enum)]
        backend: Option<BackendMode>,
        #[arg(long)]
        local_voice: Option<String>,
        #[arg(long)]
        cloud_voice: Option<String>,
        #[arg(long)]
        speed: Option<f32>,
        #[arg(long)]
        lang: Option<String>,
        #[arg(long)]
        text_file: Option<PathBuf>,
        #[arg(long)]
        status_file: Option<PathBuf>,
    },
    /// Run the local synthesis daemon
    Daemon {
        /// Exit when the launching process exits
        #[arg(long)]
        managed: bool,
        /// Append logs to this file instead of stderr
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Synthesize stdin once without a daemon; prints the WAV path
    Synth {
        #[arg(long)]
        voice: Option<String>,
        #[arg(long)]
        speed: Option<f32>,
        #[arg(long)]
        lang: Option<String>,
    },
    /// Start or stop speaking in the running host
    Toggle,
    /// Restart speech in the running host from the current position
    Respeak,
    /// Show daemon and playback state
    Status,
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    // Suppress noisy ort internals
    let filter = if verbose {
        EnvFilter::new("debug,ort=info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ort=warn"))
    };

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        // stdout is reserved for `synth` output
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Run);

    let log_file = match &command {
        Command::Daemon { log_file, .. } => log_file.as_deref(),
        _ => None,
    };
    init_logging(args.verbose, log_file)?;

    let config = Config::load(args.config.as_deref());
    let config_path = Config::resolve_path(args.config.as_deref());
    let paths = RuntimePaths::from_env();

    match command {
        Command::Run => {
            info!("speak-rs starting");
            let runtime = AppRuntime::new(config, config_path, paths, args.verbose)?;
            runtime.run().await?;
        }
        Command::Speak {
            backend,
            local_voice,
            cloud_voice,
            speed,
            lang,
            text_file,
            status_file,
        } => {
            let defaults = config.voice.clone();
            let voice = VoiceConfig {
                backend: backend.unwrap_or(defaults.backend),
                local_voice: local_voice.unwrap_or(defaults.local_voice),
                cloud_voice: cloud_voice.unwrap_or(defaults.cloud_voice),
                speed: speed.unwrap_or(defaults.speed),
                lang: lang.unwrap_or(defaults.lang),
            };
            let text_file = text_file.unwrap_or_else(|| paths.text_snapshot.clone());
            let status_file = status_file.unwrap_or_else(|| paths.playback_status.clone());
            let code = worker::run_worker(&config, config_path, &paths, &voice, &text_file, &status_file).await;
            std::process::exit(code);
        }
        Command::Daemon { managed, .. } => {
            let options = DaemonOptions::from_config(&config, paths, managed);
            let local = config.local.clone();
            run_daemon(options, move || {
                KokoroEngine::load(&local).map(|engine| Box::new(engine) as Box<dyn SpeechModel>)
            })
            .await?;
        }
        Command::Synth { voice, speed, lang } => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            let params = VoiceParams {
                voice: voice.unwrap_or(config.voice.local_voice),
                speed: speed.unwrap_or(config.voice.speed),
                lang: lang.unwrap_or(config.voice.lang),
            };
            let local = config.local;
            let path = tokio::task::spawn_blocking(move || {
                let mut engine = KokoroEngine::load(&local).map_err(|e| e.to_string())?;
                render_to_wav(&mut engine, &text, &params)
            })
            .await??;
            println!("{}", path.display());
        }
        Command::Toggle => {
            let pid = service::signal_host(&paths, nix::sys::signal::Signal::SIGUSR1)?;
            info!("Sent toggle to host {pid}");
        }
        Command::Respeak => {
            let pid = service::signal_host(&paths, nix::sys::signal::Signal::SIGUSR2)?;
            info!("Sent respeak to host {pid}");
        }
        Command::Status => print_status(&config, &paths).await,
    }

    Ok(())
}

async fn print_status(config: &Config, paths: &RuntimePaths) {
    match paths::read_pid(&paths.host_pid) {
        Some(pid) if speak_rs::process::is_alive(pid) => println!("host:     running (pid {pid})"),
        _ => println!("host:     not running"),
    }

    let daemon_pid = paths::read_pid(&paths.daemon_pid);
    let client = DaemonClient::new(
        paths.socket.clone(),
        config.daemon.connect_timeout(),
        config.daemon.connect_timeout(),
    );
    match (client.ping().await, daemon_pid) {
        (Ok((pid, state)), _) => println!("daemon:   {state} (pid {pid})"),
        (Err(_), Some(pid)) => println!("daemon:   not responding (pid file says {pid})"),
        (Err(_), None) => println!("daemon:   not running"),
    }

    let text = status::read_snapshot(&paths.text_snapshot);
    match status::read_status(&paths.playback_status) {
        Some(playback) if playback.estimated_duration_secs > 0.0 => {
            let now = chrono::Utc::now().timestamp();
            let elapsed = (now - playback.started_at_epoch_secs).max(0) as f64;
            let ratio = (elapsed / playback.estimated_duration_secs).min(1.0);
            println!(
                "playback: {:.0}% of {:.1}s ({} chars)",
                ratio * 100.0,
                playback.estimated_duration_secs,
                text.map(|t| t.chars().count()).unwrap_or(0)
            );
        }
        _ => println!("playback: none"),
    }

    if !config.local.is_installed() {
        warn!("Local model not found in {}", config.local.model_dir.display());
    }
}
