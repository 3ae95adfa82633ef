use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::domain::BoostOrder;

#[derive(Debug, Parser)]
#[command(name = "energy-diverter", version, about = "Surplus-following mode control and price-aware boost scheduling")]
pub struct Cli {
    /// Configuration file, overridden by DIVERTER__* environment variables
    #[arg(short, long, env = "DIVERTER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run both cadences (and the API, if enabled) until interrupted
    Run,
    /// One mode tick and one boost pass, then exit
    Once,
    /// Request, clear or preview a boost for one device
    Boost(BoostArgs),
    /// Print the persisted device ledger and pending requests
    Status,
    /// Clear a FAILED device back to UNKNOWN
    Reset {
        #[arg(short, long)]
        device: String,
    },
}

#[derive(Debug, Args)]
pub struct BoostArgs {
    #[arg(short, long)]
    pub device: String,

    /// Energy to deliver in kWh
    #[arg(long, conflicts_with_all = ["target_soc", "reset"])]
    pub charge: Option<f64>,

    /// Charge until the vehicle reaches this SOC (percent)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100), conflicts_with = "reset")]
    pub target_soc: Option<u8>,

    /// Charge rate in kW, defaults to the configured device rate
    #[arg(long)]
    pub rate: Option<f64>,

    /// Finish by the next occurrence of this hour
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..24))]
    pub by_hour: Option<u32>,

    /// Add to the installed windows instead of replacing them
    #[arg(long)]
    pub keep_existing: bool,

    /// Remove all boost windows
    #[arg(long)]
    pub reset: bool,

    /// Print the plan without commanding the device
    #[arg(long)]
    pub dry_run: bool,
}

impl BoostArgs {
    pub fn order(&self) -> BoostOrder {
        BoostOrder {
            energy_kwh: self.charge,
            target_soc: self.target_soc.map(f64::from),
            rate_kw: self.rate,
            by_hour: self.by_hour,
            complete_by: None,
            keep_existing: self.keep_existing,
        }
    }
}
