//! advmesh binary.
//!
//! Runs several mesh stacks over an in-memory broadcast medium, decodes
//! captured network PDUs and derives key identifiers.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod inspect;
mod logging;
mod sim;

use config::MeshConfig;
use logging::MeshLogFormatter;
use sim::Simulation;

/// Mesh network and transport layer tool
#[derive(Parser, Debug)]
#[command(name = "advmesh", version, about = "Mesh network and transport layer tool")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "mesh.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the configured script across the simulated nodes
    Simulate {
        /// Stop after this long even if packets are still in flight
        #[arg(long, default_value = "5s")]
        duration: humantime::Duration,
    },
    /// Decrypt a network PDU with the configured keys
    Decode {
        /// Network PDU, hex
        packet: String,
    },
    /// Derive the NID from a NetKey and the AID from an AppKey
    Derive {
        /// NetKey, hex
        #[arg(long)]
        net_key: Option<String>,
        /// AppKey, hex
        #[arg(long)]
        app_key: Option<String>,
    },
}

fn env_filter(level: &str) -> Result<EnvFilter> {
    Ok(EnvFilter::new("warn")
        .add_directive(format!("advmesh={}", level).parse()?)
        .add_directive(format!("mesh_wire={}", level).parse()?)
        .add_directive(format!("mesh_storage={}", level).parse()?)
        .add_directive(format!("mesh_transport={}", level).parse()?))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let initial_level = args.log_level.clone().unwrap_or_else(|| "info".to_string());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&initial_level)?)
        .with_writer(std::io::stderr)
        .event_format(MeshLogFormatter::new("advmesh".to_string()))
        .with_filter_reloading();
    let reload = builder.reload_handle();
    builder.init();

    info!("Starting advmesh v{}", env!("CARGO_PKG_VERSION"));

    if let Command::Derive { net_key, app_key } = &args.command {
        let out = inspect::derive_keys(net_key.as_deref(), app_key.as_deref())?;
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mesh_config = MeshConfig::load_from_file(&args.config)?;
    if args.log_level.is_none() && mesh_config.log_level != initial_level {
        reload.reload(env_filter(&mesh_config.log_level)?)?;
    }

    match args.command {
        Command::Simulate { duration } => {
            let mut simulation = Simulation::new(&mesh_config)?;
            simulation
                .run(&mesh_config.script, duration.into())
                .await?;
            info!("Simulation finished");
            println!("{}", serde_json::to_string_pretty(&simulation.report())?);
        }
        Command::Decode { packet } => {
            let out = inspect::decode_packet(&mesh_config, &packet)?;
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Derive { .. } => {}
    }

    Ok(())
}
