//! cadencectl - Cadence control utility

use anyhow::Result;
use cadence::hotplug::HotplugEvent;
use cadence::ipc::IpcClient;
use clap::{Parser, Subcommand, ValueEnum};

/// Cadence control utility
#[derive(Parser)]
#[command(name = "cadencectl", version, about = "Control the Cadence scaling daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Socket path
    #[arg(long, default_value = "/run/cadence/cadence.sock")]
    socket: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show engine status
    Status,

    /// Show a core's frequency
    Get {
        /// Core index
        cpu: usize,
    },

    /// Set a core's frequency
    Set {
        /// Core index
        cpu: usize,

        /// Frequency in kHz (must match a table row)
        khz: u32,
    },

    /// List available frequencies
    List {
        /// Include rows not enabled for scaling
        #[arg(long)]
        all: bool,
    },

    /// Deliver a hot-plug lifecycle event
    Hotplug {
        /// Core index
        cpu: usize,

        #[arg(value_enum)]
        event: EventArg,
    },

    /// Core voltage table
    Voltage {
        #[command(subcommand)]
        command: VoltageCommands,
    },

    /// Enable overclock rows up to a frequency
    Limit {
        /// Maximum frequency in kHz
        khz: u32,
    },
}

#[derive(Subcommand)]
enum VoltageCommands {
    /// Show the core voltage of every row
    Show,

    /// Override one row's core voltage
    Set {
        /// Frequency in kHz
        khz: u32,

        /// Voltage in uV
        uv: u32,
    },

    /// Shift every row by a signed amount
    Adjust {
        /// Delta in uV
        #[arg(allow_hyphen_values = true)]
        delta_uv: i32,
    },

    /// Set the core-rail floor
    Floor {
        /// Voltage in uV
        uv: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum EventArg {
    Dying,
    Dead,
    UpCanceled,
    UpPrepare,
    Starting,
}

impl From<EventArg> for HotplugEvent {
    fn from(arg: EventArg) -> Self {
        match arg {
            EventArg::Dying => HotplugEvent::Dying,
            EventArg::Dead => HotplugEvent::Dead,
            EventArg::UpCanceled => HotplugEvent::UpCanceled,
            EventArg::UpPrepare => HotplugEvent::UpPrepare,
            EventArg::Starting => HotplugEvent::Starting,
        }
    }
}

fn mhz(khz: u32) -> String {
    format!("{:.1} MHz", khz as f64 / 1000.0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = IpcClient::new(&cli.socket);

    match cli.command {
        Commands::Status => {
            let status = client.get_status().await?;
            let engine = &status.engine;

            println!("Cadence Status");
            println!("==============");
            println!("Version:       {}", status.version);
            println!("Plan:          {}", engine.plan);
            println!("Floor:         {} uV", engine.floor_uv);
            println!("Boost:         {}", if engine.boost { "on" } else { "off" });
            println!();

            println!("Cores:");
            for (core, lifecycle) in engine.cores.iter().zip(&status.lifecycle) {
                println!("  cpu{}: {} ({:?})", core.cpu, mhz(core.khz), lifecycle);
                println!(
                    "    vote {}  core {} uV  mem {} uV  dig {} uV",
                    mhz(core.vote_khz),
                    core.core_uv,
                    core.mem_uv,
                    core.dig_uv
                );
                match core.last_change {
                    Some(at) => println!("    {} transitions, last at {}", core.transitions, at),
                    None => println!("    {} transitions", core.transitions),
                }
            }
            println!();

            println!("L2:            {} (level {})", mhz(engine.shared.khz), engine.shared.level);
            match engine.shared.bw_mbps {
                Some(mbps) => println!("Bandwidth:     level {} ({} MB/s)", engine.shared.bw_level, mbps),
                None => println!("Bandwidth:     level {}", engine.shared.bw_level),
            }
        }

        Commands::Get { cpu } => {
            let khz = client.get_rate(cpu).await?;
            println!("cpu{}: {}", cpu, mhz(khz));
        }

        Commands::Set { cpu, khz } => {
            client.set_rate(cpu, khz).await?;
            println!("cpu{} set to {}", cpu, mhz(khz));
        }

        Commands::List { all } => {
            for khz in client.list_frequencies(all).await? {
                println!("{}", khz);
            }
        }

        Commands::Hotplug { cpu, event } => {
            let state = client.hotplug(cpu, event.into()).await?;
            println!("cpu{}: {:?}", cpu, state);
        }

        Commands::Voltage { command } => match command {
            VoltageCommands::Show => {
                for entry in client.voltage_table().await? {
                    println!("{:>8} kHz  {:>8} uV", entry.khz, entry.uv);
                }
            }

            VoltageCommands::Set { khz, uv } => {
                client.set_core_voltage(khz, uv).await?;
                println!("{} kHz set to {} uV", khz, uv);
            }

            VoltageCommands::Adjust { delta_uv } => {
                for entry in client.adjust_voltages(delta_uv).await? {
                    println!("{:>8} kHz  {:>8} uV", entry.khz, entry.uv);
                }
            }

            VoltageCommands::Floor { uv } => {
                client.set_voltage_floor(uv).await?;
                println!("Floor set to {} uV", uv);
            }
        },

        Commands::Limit { khz } => {
            let frequencies = client.set_scaling_limit(khz).await?;
            println!("Scaling frequencies:");
            for khz in frequencies {
                println!("  {}", mhz(khz));
            }
        }
    }

    Ok(())
}
