//! # rust_psu CLI
//!
//! Command-line front end for KORAD-style bench power supplies.
//!
//! ```bash
//! # list candidate ports
//! rust_psu ports
//!
//! # read everything once
//! rust_psu --port /dev/ttyACM0 status
//!
//! # change setpoints and switch the output on
//! rust_psu --port /dev/ttyACM0 set --voltage 12 --current 0.5 --output on
//!
//! # watch the readings until Ctrl-C, against the built-in simulator
//! rust_psu --simulate monitor --interval-ms 250
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rust_psu::config::PsuConfig;
use rust_psu::logging::init_tracing;
use rust_psu::transport::sim::SimulatedSupply;
use rust_psu::{PropertyId, PsuSession, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// rust_psu - bench power supply control
#[derive(Parser, Debug)]
#[command(name = "rust_psu")]
#[command(about = "Control and monitor KORAD-style bench power supplies", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = rust_psu::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial port, overriding the configuration file
    #[arg(long, global = true)]
    port: Option<String>,

    /// Baud rate, overriding the configuration file
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Talk to a simulated supply instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports a supply may be attached to
    Ports,

    /// Synchronise with the supply and print every property
    Status,

    /// Query a single property
    Get {
        /// Property name (e.g. set_voltage, actual_current, status)
        property: PropertyId,
    },

    /// Change setpoints
    Set {
        #[arg(long)]
        voltage: Option<f64>,
        #[arg(long)]
        current: Option<f64>,
        #[arg(long, value_enum)]
        output: Option<Switch>,
        #[arg(long, value_enum)]
        ovp: Option<Switch>,
        #[arg(long, value_enum)]
        ocp: Option<Switch>,
        #[arg(long, value_enum)]
        beep: Option<Switch>,
    },

    /// Poll the supply and print readings until Ctrl-C
    Monitor {
        /// Polling interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Stop after this many readings
        #[arg(long)]
        cycles: Option<u64>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl From<Switch> for Value {
    fn from(s: Switch) -> Self {
        Value::Flag(matches!(s, Switch::On))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = PsuConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if cli.port.is_some() {
        config.serial.port = cli.port.clone();
    }
    if let Some(baud) = cli.baud {
        config.serial.baud_rate = baud;
    }
    if let Commands::Monitor {
        interval_ms: Some(ms),
        ..
    } = cli.command
    {
        config.polling.interval_ms = ms;
    }
    config.validate()?;
    init_tracing(&config.logging);

    if let Commands::Ports = cli.command {
        return list_ports(cli.json);
    }

    let session = PsuSession::new(config.session_settings());
    // keeps the simulator handle alive for the whole run
    let _simulator = connect(&session, &cli, &config).await?;

    let result = run(&session, &cli, &config).await;
    session.close().await;
    result
}

fn list_ports(json: bool) -> Result<()> {
    let ports = PsuSession::list_ports().context("Failed to enumerate serial ports")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
    } else if ports.is_empty() {
        println!("No USB serial ports found");
    } else {
        for port in ports {
            println!(
                "{:<20} {:<30} pid=0x{:04x}",
                port.system_name, port.manufacturer_description, port.product_id
            );
        }
    }
    Ok(())
}

async fn connect(
    session: &PsuSession,
    cli: &Cli,
    config: &PsuConfig,
) -> Result<Option<SimulatedSupply>> {
    if cli.simulate {
        let (supply, link) = SimulatedSupply::spawn();
        session.attach("simulated", link).await;
        return Ok(Some(supply));
    }

    let Some(port) = config.serial.port.as_deref() else {
        bail!("No serial port configured; pass --port or use --simulate");
    };
    session
        .open(port, config.serial.baud_rate)
        .await
        .with_context(|| format!("Failed to open {}", port))?;
    Ok(None)
}

async fn run(session: &PsuSession, cli: &Cli, config: &PsuConfig) -> Result<()> {
    match &cli.command {
        Commands::Ports => Ok(()),

        Commands::Status => {
            session.init().await.context("Initial synchronisation failed")?;
            print_snapshot(session, cli.json)
        }

        Commands::Get { property } => {
            let value = session
                .refresh(*property)
                .await
                .with_context(|| format!("Failed to query {}", property))?;
            if cli.json {
                println!("{}", serde_json::to_string(&value)?);
            } else {
                println!("{} = {}", property, value);
            }
            Ok(())
        }

        Commands::Set {
            voltage,
            current,
            output,
            ovp,
            ocp,
            beep,
        } => {
            session.init().await.context("Initial synchronisation failed")?;
            let changes: [(PropertyId, Option<Value>); 6] = [
                (PropertyId::SetVoltage, voltage.map(Value::from)),
                (PropertyId::SetCurrent, current.map(Value::from)),
                (PropertyId::Ovp, ovp.map(Value::from)),
                (PropertyId::Ocp, ocp.map(Value::from)),
                (PropertyId::Beep, beep.map(Value::from)),
                (PropertyId::Output, output.map(Value::from)),
            ];
            for (id, value) in changes {
                if let Some(value) = value {
                    session
                        .assign(id, value)
                        .await
                        .with_context(|| format!("Failed to set {}", id))?;
                }
            }
            session.update().await.context("Read-back failed")?;
            print_snapshot(session, cli.json)
        }

        Commands::Monitor { cycles, .. } => {
            session.init().await.context("Initial synchronisation failed")?;
            session.set_polling(true).await;
            let interval = Duration::from_millis(config.polling.interval_ms);
            monitor(session, *cycles, interval, cli.json).await;
            session.set_polling(false).await;
            Ok(())
        }
    }
}

async fn monitor(session: &PsuSession, cycles: Option<u64>, interval: Duration, json: bool) {
    let mut ticker = tokio::time::interval(interval);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut printed = 0u64;
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {
                print_reading(session, json);
                printed += 1;
                if cycles.is_some_and(|n| printed >= n) {
                    break;
                }
                if !session.is_online() {
                    warn!("Supply went offline");
                }
            }
        }
    }
}

fn print_reading(session: &PsuSession, json: bool) {
    let snapshot = session.snapshot();
    let v = snapshot.get(PropertyId::ActualVoltage).cloned();
    let i = snapshot.get(PropertyId::ActualCurrent).cloned();
    let status = snapshot.get(PropertyId::Status).cloned();

    if json {
        let line = serde_json::json!({
            "revision": snapshot.revision,
            "actual_voltage": v,
            "actual_current": i,
            "status": status,
        });
        println!("{}", line);
    } else {
        let show = |v: Option<Value>| v.map(|v| v.to_string()).unwrap_or_default();
        println!("{:>8} V {:>8} A  {}", show(v), show(i), show(status));
    }
}

fn print_snapshot(session: &PsuSession, json: bool) -> Result<()> {
    let snapshot = session.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        for (id, value) in &snapshot.values {
            println!("{:<16} {}", id.to_string(), value);
        }
    }
    Ok(())
}
