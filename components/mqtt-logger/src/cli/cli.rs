// Local crates
use crate::helpers::load_config::{Config, Settings};
use crate::instrumentation::tracing::{TraceFormat, init_panic_handler, init_tracing};
use crate::logger::facility::facility_names;
use crate::runtime;

// External crates
use anyhow::Result;
use clap::{Args, Parser, Subcommand, builder::FalseyValueParser};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;

/// Command line of the `mqtt-logger` binary.
#[derive(Parser, Debug)]
#[command(
    name = "mqtt-logger",
    long_about = "mqtt-logger subscribes to an MQTT broker and writes every delivered message to the system log.",
    about = "Log MQTT messages to syslog",
    version,
    term_width = 100,
    after_help = "\
    EXAMPLES:
        mqtt-logger run --broker tcp://localhost:1883 --topic 'sensors/#'
        BROKER=broker.lan FACILITY=LOG_LOCAL3 mqtt-logger run
        mqtt-logger validate --config /etc/mqtt-logger.toml"
)]
pub struct Cli {
    /// Format of internal diagnostics written to stderr (filter with RUST_LOG)
    #[arg(long, global = true, value_enum, default_value_t = TraceFormat::Text)]
    pub trace_format: TraceFormat,

    /// What to do
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to the broker and log messages until SIGINT/SIGTERM
    Run(RunArgs),

    /// Validate the configuration file without connecting
    Validate {
        /// Configuration file to check
        #[arg(short, long, env = "MQTT_LOGGER_CONFIG")]
        config: PathBuf,
    },

    /// Display version information
    Version,
}

/// Options of `run`. Every value falls back to its environment variable,
/// then to the configuration file, then to the built-in default.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Broker address, `host`, `host:port` or `tcp://host:port`
    #[arg(short, long, env = "BROKER")]
    pub broker: Option<String>,

    /// Topic filter to subscribe to [default: #]
    #[arg(short, long, env = "TOPIC")]
    pub topic: Option<String>,

    /// User name for the broker
    #[arg(short, long, env = "USERNAME")]
    pub username: Option<String>,

    /// Password for the broker
    #[arg(short, long, env = "PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Syslog facility name, e.g. LOG_LOCAL6 [default: LOG_LOCAL6]
    #[arg(short, long, env = "FACILITY")]
    pub facility: Option<String>,

    /// Do not mirror log lines to stderr
    #[arg(
        short = 's',
        long,
        env = "NO_LOG_TO_STDERR",
        action = clap::ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    pub no_log_to_stderr: bool,

    /// Optional TOML configuration file
    #[arg(short, long, env = "MQTT_LOGGER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of logging worker threads [default: available cores]
    #[arg(short, long, env = "WORKERS")]
    pub workers: Option<NonZeroUsize>,

    /// QoS of the subscription, 0, 1 or 2 [default: 0]
    #[arg(short, long, env = "QOS")]
    pub qos: Option<u8>,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

/// Entry function for CLI
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let _guard = init_tracing(cli.trace_format)?;
    init_panic_handler();

    match cli.command {
        Commands::Run(args) => run_logger(args).await?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

//
// ------------------------ Command Implementations ------------------------------
//

/// Resolve settings and hand over to the runtime
async fn run_logger(args: RunArgs) -> Result<()> {
    let file = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let settings = Settings::resolve(&args, &file)?;
    runtime::runtime::run_mqtt_logger(settings).await
}

/// Validate configuration file
fn validate_config(config: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config);
    let cfg = Config::load(&config)?;
    if let Err(e) = cfg.validate() {
        if matches!(e, crate::helpers::load_config::ConfigError::Facility(_)) {
            println!(
                "Known facilities: {}",
                facility_names().collect::<Vec<_>>().join(", ")
            );
        }
        return Err(e.into());
    }
    println!("Configuration valid:\n{:#?}", cfg);
    Ok(())
}

/// Show version information
fn show_version() {
    println!("mqtt-logger {}", env!("CARGO_PKG_VERSION"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "mqtt-logger",
            "run",
            "-b",
            "tcp://localhost:1883",
            "-t",
            "sensors/#",
            "-f",
            "LOG_LOCAL0",
            "-s",
            "-w",
            "3",
            "--metrics-addr",
            "127.0.0.1:9000",
        ])
        .expect("arguments parse");

        let Commands::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.broker.as_deref(), Some("tcp://localhost:1883"));
        assert_eq!(args.topic.as_deref(), Some("sensors/#"));
        assert_eq!(args.facility.as_deref(), Some("LOG_LOCAL0"));
        assert!(args.no_log_to_stderr);
        assert_eq!(args.workers, NonZeroUsize::new(3));
        assert_eq!(args.metrics_addr, Some("127.0.0.1:9000".parse().expect("socket addr")));
        assert_eq!(cli.trace_format, TraceFormat::Text);
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(Cli::try_parse_from(["mqtt-logger", "run", "-w", "0"]).is_err());
    }

    #[test]
    fn trace_format_is_global() {
        let cli = Cli::try_parse_from(["mqtt-logger", "version", "--trace-format", "json"])
            .expect("arguments parse");
        assert_eq!(cli.trace_format, TraceFormat::Json);
        assert!(matches!(cli.command, Commands::Version));
    }

    #[test]
    fn validate_requires_a_path() {
        let cli = Cli::try_parse_from(["mqtt-logger", "validate", "--config", "/etc/mqtt-logger.toml"])
            .expect("arguments parse");
        let Commands::Validate { config } = cli.command else {
            panic!("expected validate subcommand");
        };
        assert_eq!(config, PathBuf::from("/etc/mqtt-logger.toml"));
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn validate_rejects_unknown_facility() {
        let file = write_config("[logging]\nfacility = \"LOG_NOPE\"\n");

        let err = validate_config(file.path().to_path_buf()).expect_err("facility is unknown");
        assert!(err.to_string().contains("LOG_NOPE"), "{err}");
    }

    #[test]
    fn validate_accepts_a_complete_file() {
        let file = write_config(
            "[broker]\naddress = \"tcp://localhost:1883\"\n\n[logging]\nfacility = \"LOG_LOCAL3\"\n",
        );

        assert!(validate_config(file.path().to_path_buf()).is_ok());
    }
}
