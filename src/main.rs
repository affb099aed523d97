//! RelayMQ - QoS delivery simulation
//!
//! Usage:
//!   relaymq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file path
//!   -q, --qos <N>            QoS the publisher sends at (0, 1, or 2)
//!   -m, --messages <N>       Messages to publish
//!   -s, --subscribers <N>    Number of subscriber clients
//!   -d, --drop-every <N>     Lose every N-th packet on each link (0 = never)
//!   --max-retries <N>        Retransmissions before an exchange is abandoned
//!   -l, --log-level          Log level (error, warn, info, debug, trace)
//!   -h, --help               Print help

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use relaymq::config::Config;
use relaymq::protocol::QoS;
use relaymq::simulation::{self, SimulationConfig};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

/// RelayMQ - MQTT QoS delivery simulation
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(author = "RelayMQ Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Simulates MQTT QoS 0/1/2 delivery between a publisher and subscribers over lossy links")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// QoS the publisher sends at (0, 1, or 2)
    #[arg(short, long)]
    qos: Option<u8>,

    /// Number of messages to publish
    #[arg(short, long)]
    messages: Option<usize>,

    /// Number of subscriber clients
    #[arg(short, long)]
    subscribers: Option<usize>,

    /// Lose every N-th packet on each link (0 = never)
    #[arg(short, long)]
    drop_every: Option<usize>,

    /// Retransmissions before an exchange is abandoned
    #[arg(long)]
    max_retries: Option<u32>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus environment
    let loaded = match &args.config {
        Some(config_path) => Config::load(config_path),
        None => Config::from_env(),
    };
    let mut file_config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - RUST_LOG wins, then CLI, then config, then default (warn)
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let log_level = args
            .log_level
            .unwrap_or_else(|| LogLevel::from_config(&file_config.log.level));
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level.to_tracing_level())
            .with_target(false)
            .with_thread_ids(true)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    if let Some(ref path) = args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    if let Some(qos) = args.qos {
        if QoS::from_u8(qos).is_none() {
            eprintln!("Invalid qos value: {}. Must be 0, 1, or 2.", qos);
            std::process::exit(1);
        }
        file_config.simulation.qos = qos;
    }
    if let Some(messages) = args.messages {
        file_config.simulation.messages = messages;
    }
    if let Some(subscribers) = args.subscribers {
        file_config.simulation.subscribers = subscribers;
    }
    if let Some(drop_every) = args.drop_every {
        file_config.simulation.drop_every = drop_every;
    }
    if let Some(max_retries) = args.max_retries {
        file_config.retry.max_retries = max_retries;
    }

    let config = SimulationConfig::from_config(&file_config);
    info!("Starting RelayMQ simulation");
    info!("  Messages: {} at QoS {}", config.messages, config.qos);
    info!(
        "  Subscribers: {} at QoS {}",
        config.subscribers, config.subscriber_qos
    );
    info!("  Drop every: {}", config.drop_every);
    info!(
        "  Retry: {:?} (max {} retries)",
        config.broker.retry.interval, config.broker.retry.max_retries
    );

    let report = simulation::run(config).await?;
    println!("{}", report);
    println!();
    print!("{}", report.metrics);

    Ok(())
}
