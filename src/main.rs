//! Binary entrypoint for the meshrelay CLI.
//!
//! Commands:
//! - `start` - run the relay until Ctrl-C
//! - `init` - write a starter `config.toml`
//! - `check-config` - load and validate the configuration, then print a summary
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use meshrelay::bridge::Bridge;
use meshrelay::config::Config;

#[derive(Parser)]
#[command(name = "meshrelay")]
#[command(about = "Relay messages between a Meshtastic mesh and Matrix rooms")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay
    Start,
    /// Write a default configuration file
    Init,
    /// Validate the configuration file
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            println!("Wrote default configuration to {}", cli.config);
            println!("Edit the [meshtastic], [matrix] and [[matrix_rooms]] sections, then run `meshrelay start`.");
        }
        Commands::CheckConfig => {
            let config = Config::load(&cli.config).await?;
            config.validate()?;
            let connection = config.connection_config()?;
            println!("Configuration OK");
            println!("  mesh link:  {}", connection.target);
            println!("  meshnet:    {}", connection.meshnet_name);
            println!("  homeserver: {}", config.matrix.homeserver);
            for room in config.room_mappings() {
                println!("  channel {} -> {}", room.mesh_channel, room.room_id);
            }
        }
        Commands::Start => {
            let config = Config::load(&cli.config).await?;
            init_logging(&config, cli.verbose);
            config.validate()?;
            info!("Starting meshrelay v{}", env!("CARGO_PKG_VERSION"));
            Bridge::new(config).run().await?;
        }
    }

    Ok(())
}

fn init_logging(config: &Config, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let configured = config
        .logging
        .level
        .parse::<log::LevelFilter>()
        .unwrap_or(log::LevelFilter::Info);
    // -v / -vv override the configured level
    let level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);

    let file = config.logging.file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("Cannot open log file {}: {}", path, e))
            .ok()
    });

    match file {
        Some(f) => {
            let sink = std::sync::Mutex::new(f);
            // Mirror to the console only when attached to a terminal.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = sink.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
