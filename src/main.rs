//! probe-logger daemon entry point.
//!
//! Startup happens synchronously: configuration, discovery and sink setup all
//! finish before the process forks. The tokio runtime is built afterwards so
//! the detached child never inherits runtime threads.

#![warn(rust_2018_idioms)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use probe_logger::{
    daemonize, init_logging, parse_interval, AliasTable, Config, Daemon, DiscoveryOptions,
    ErrorPolicy, Overrides, ProbeLogError, ProbeRegistry, SystemError, DAEMON_NAME,
    DAEMON_VERSION, DEFAULT_CONFIG_PATH,
};

// ============================================================================
// SECTION 1: COMMAND LINE INTERFACE
// ============================================================================

/// DS18B20 temperature logger
#[derive(Parser, Debug)]
#[command(
    name = "probe-logger",
    version,
    about = "Polls DS18B20 one-wire temperature probes and logs their readings",
    long_about = "probe-logger discovers DS18B20 probes exposed by the w1-therm kernel \
                  driver, samples them on a fixed interval and appends the readings to \
                  per-probe log files and/or rrdtool databases. SIGHUP reopens the log \
                  files, SIGTERM stops the daemon."
)]
struct Cli {
    /// Configuration file (TOML, or the classic key/value format)
    #[arg(short, long, env = "PROBELOG_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose diagnostics
    #[arg(short, long)]
    verbose: bool,

    /// Do not daemonize
    #[arg(short, long)]
    foreground: bool,

    /// Append readings to <log_root>/<probe>.log
    #[arg(short, long)]
    log: bool,

    /// Maintain rrd files
    #[arg(short, long)]
    rrd: bool,

    /// Run once: print temperatures to the screen and exit
    #[arg(short, long)]
    once: bool,

    /// Sampling interval, in seconds or as a duration such as `5m`
    #[arg(short, long, value_parser = parse_interval)]
    interval: Option<Duration>,

    /// What a failed probe read does to the loop
    #[arg(long, value_enum)]
    on_error: Option<ErrorPolicy>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover and list probes
    Probes {
        /// Machine readable output
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration and print a summary
    Validate {
        /// Also print the effective configuration as TOML
        #[arg(long)]
        full: bool,
    },

    /// Generate a default TOML configuration
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            verbose: self.verbose,
            foreground: self.foreground,
            log: self.log,
            rrd: self.rrd,
            once: self.once,
            interval: self.interval,
            on_error: self.on_error,
        }
    }

    fn load_config(&self) -> AnyhowResult<Config> {
        let mut config = Config::resolve(self.config.as_deref())
            .with_context(|| format!("failed to load configuration from {}", self.config_display()))?;
        config.apply_overrides(&self.overrides());
        Ok(config)
    }

    fn config_display(&self) -> String {
        self.config
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH))
            .display()
            .to_string()
    }
}

// ============================================================================
// SECTION 2: SUBCOMMAND HANDLERS
// ============================================================================

fn handle_version() {
    println!("🌡  {} v{}", DAEMON_NAME, DAEMON_VERSION);
    println!();
    println!("Default configuration: {}", DEFAULT_CONFIG_PATH);
    println!("Supported sensors:     DS18B20 (w1-therm)");
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let rendered = Config::generate_default_config()?;

    match output {
        Some(path) => {
            fs::write(path, &rendered)
                .with_context(|| format!("cannot write {}", path.display()))?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", rendered),
    }

    Ok(())
}

fn handle_validate(cli: &Cli, full: bool) -> AnyhowResult<()> {
    println!("Validating configuration: {}", cli.config_display());

    let checked = cli.load_config().and_then(|config| {
        let config = config.finalize()?;
        let aliases = AliasTable::new(&config.aliases)?;
        Ok((config, aliases))
    });

    let (config, aliases) = match checked {
        Ok(valid) => valid,
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {:#}", e);
            return Err(e);
        }
    };

    println!("✅ Configuration is valid!");

    if full {
        println!("\n📋 Effective configuration:");
        println!("{}", "=".repeat(60));
        println!("{}", toml::to_string_pretty(&config)?);
    }

    println!("\n📊 Configuration Summary:");
    println!("  • Interval: {}", humantime::format_duration(config.interval));
    println!("  • Mode: {:?}", config.run_mode());
    println!("  • On error: {}", config.on_error);
    println!("  • Device root: {}", config.paths.device_root.display());
    println!("  • Outputs:");
    if config.once {
        println!("    - Standard output (one-shot)");
    }
    if config.log {
        println!("    - Log files in {}", config.paths.log_root.display());
    }
    if config.rrd {
        println!("    - rrd databases in {}", config.paths.rrd_root.display());
    }
    println!("  • Aliases: {}", aliases.len());
    for (id, name) in aliases.iter() {
        println!("    - {} → {}", id, name);
    }

    Ok(())
}

fn handle_probes(config: &Config, json: bool) -> AnyhowResult<()> {
    let aliases = AliasTable::new(&config.aliases)?;
    let registry = ProbeRegistry::discover(&DiscoveryOptions::from_config(config), &aliases)
        .require_probes()?;

    if json {
        println!("{}", serde_json::to_string_pretty(registry.probes())?);
        return Ok(());
    }

    println!(
        "🌡  {} probe(s) under {}",
        registry.len(),
        registry.device_root().display()
    );
    for probe in registry.probes() {
        println!("  • {}", probe.display_name);
        if probe.is_aliased() {
            println!("      id:     {}", probe.raw_id);
        }
        println!("      device: {}", probe.source.display());
        println!("      log:    {}", probe.sink_target.display());
    }

    Ok(())
}

// ============================================================================
// SECTION 3: DAEMON STARTUP
// ============================================================================

fn run_daemon(cli: &Cli, logging_ready: &mut bool) -> AnyhowResult<ExitCode> {
    let config = cli.load_config()?.finalize()?;

    let mut logging = config.logging.clone();
    if !config.foreground {
        logging.colors = false;
    }
    let diagnostics = init_logging(&logging, config.verbose)?;
    *logging_ready = true;

    if Config::falls_back_to_defaults(cli.config.as_deref()) {
        warn!(
            target: "probelog::config",
            path = DEFAULT_CONFIG_PATH,
            "Configuration file not found, using defaults"
        );
    }

    info!(
        target: "probelog::main",
        version = DAEMON_VERSION,
        config = %cli.config_display(),
        "{} starting",
        DAEMON_NAME
    );

    let daemon = Daemon::prepare(config)?;

    let _pid_file = if daemon.config().foreground {
        None
    } else {
        diagnostics.redirect_to_file(&logging.file, logging.rotation)?;
        Some(daemonize(&daemon.daemon_options())?)
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|source| ProbeLogError::from(SystemError::Runtime { source }))?;

    let outcome = runtime.block_on(daemon.run());
    // A hung w1 read may still hold a blocking-pool thread.
    runtime.shutdown_background();
    let outcome = outcome?;
    info!(target: "probelog::main", outcome = ?outcome, "{} exiting", DAEMON_NAME);

    Ok(ExitCode::SUCCESS)
}

fn run(cli: Cli, logging_ready: &mut bool) -> AnyhowResult<ExitCode> {
    match &cli.command {
        Some(Commands::Version) => handle_version(),
        Some(Commands::GenerateConfig { output }) => handle_generate_config(output.as_deref())?,
        Some(Commands::Validate { full }) => handle_validate(&cli, *full)?,
        Some(Commands::Probes { json }) => handle_probes(&cli.load_config()?, *json)?,
        None => return run_daemon(&cli, logging_ready),
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION 4: MAIN ENTRY POINT
// ============================================================================

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut logging_ready = false;

    match run(cli, &mut logging_ready) {
        Ok(code) => code,
        Err(e) => {
            if logging_ready {
                match e.downcast_ref::<ProbeLogError>() {
                    Some(fatal) => error!(
                        target: "probelog::main",
                        phase = ?fatal.phase(),
                        category = fatal.category(),
                        "{:#}",
                        e
                    ),
                    None => error!(target: "probelog::main", "{:#}", e),
                }
            } else {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}
