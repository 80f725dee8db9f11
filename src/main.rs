use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bounce_track::config::AppConfig;
use bounce_track::session::{Consumer, Producer};
use bounce_track::transport::rtc::RtcPeer;
use bounce_track::transport::{PeerSession, TcpSignaling};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// bounce-track command line arguments
#[derive(Parser, Debug)]
#[command(name = "bounce-track")]
#[command(version, about = "WebRTC bouncing ball producer and tracking consumer", long_about = None)]
struct CliArgs {
    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render the ball, offer it and score returned coordinates
    Server(EndpointArgs),
    /// Answer, track the ball and report coordinates
    Client(EndpointArgs),
}

#[derive(Args, Debug)]
struct EndpointArgs {
    /// Rendezvous host (overrides config)
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Rendezvous port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,
}

impl EndpointArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(host) = &self.host {
            config.signaling.host = host.clone();
        }
        if let Some(port) = self.port {
            config.signaling.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting bounce-track v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load_or_default(args.config.as_deref()).await?;
    match &args.command {
        Command::Server(endpoint) | Command::Client(endpoint) => endpoint.apply(&mut config),
    }
    config.validate()?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                signal_token.cancel();
            }
            Err(e) => tracing::error!("Failed to install CTRL+C handler: {}", e),
        }
    });

    let peer: Arc<dyn PeerSession> = Arc::new(RtcPeer::new(&config.webrtc).await?);

    match args.command {
        Command::Server(_) => {
            let mut signaling = TcpSignaling::listen(&config.signaling);
            signaling.bind().await?;
            let summary = Producer::new(config, peer).run(&mut signaling, shutdown).await?;
            match summary.latest_error {
                Some(error) => tracing::info!(
                    "Session ended after {} frames; last error {} (|e| = {:.1})",
                    summary.frames_sent,
                    error,
                    error.magnitude()
                ),
                None => tracing::info!(
                    "Session ended after {} frames without coordinate reports",
                    summary.frames_sent
                ),
            }
        }
        Command::Client(_) => {
            let mut signaling = TcpSignaling::connect_to(&config.signaling);
            let summary = Consumer::new(config, peer).run(&mut signaling, shutdown).await?;
            if let Some(stats) = summary.pipeline {
                tracing::info!(
                    "Session ended: {} frames received, {} localized, {} dropped",
                    stats.submitted,
                    stats.processed,
                    stats.dropped
                );
            }
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "bounce_track=error,webrtc=error",
        LogLevel::Warn => "bounce_track=warn,webrtc=warn",
        LogLevel::Info => "bounce_track=info,webrtc=warn",
        LogLevel::Verbose => "bounce_track=debug,webrtc=warn",
        LogLevel::Debug => "bounce_track=debug,webrtc=info",
        LogLevel::Trace => "bounce_track=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
