use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::ControllerConfig;
use crate::ports::{AllocationStrategy, PortRange};

#[derive(Parser, Debug)]
#[command(name = "cacheplane")]
#[command(about = "Place, wire and run distributed cache runtimes")]
#[command(version)]
pub struct Args {
    /// Path to the controller config file (YAML or JSON)
    #[arg(short, long, value_name = "FILE", env = "CACHEPLANE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Seed file with nodes, datasets and runtimes for local mode
    #[arg(short, long, value_name = "FILE")]
    pub seed: Option<PathBuf>,

    /// Override the host-network port range, e.g. 20000-26000
    #[arg(long, value_name = "MIN-MAX", env = "CACHEPLANE_PORT_RANGE")]
    pub port_range: Option<PortRange>,

    /// Override the port allocation strategy (bitmap or random)
    #[arg(long, value_name = "STRATEGY", env = "CACHEPLANE_PORT_ALLOCATION_STRATEGY")]
    pub port_allocation_strategy: Option<AllocationStrategy>,

    /// Seed for the random port allocation strategy
    #[arg(long, value_name = "SEED")]
    pub port_allocation_seed: Option<u64>,

    /// Override the reconcile interval in seconds
    #[arg(long, value_name = "SECS")]
    pub interval: Option<u64>,

    /// Override the number of failed cache cleanups tolerated on shutdown
    #[arg(long, value_name = "N")]
    pub graceful_shutdown_limits: Option<u32>,

    /// Run a single reconcile pass and exit
    #[arg(long)]
    pub once: bool,

    /// Path to a .env file
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Apply command-line overrides on top of a loaded config
    pub fn apply_overrides(&self, mut config: ControllerConfig) -> ControllerConfig {
        if let Some(range) = self.port_range {
            config.port_range = range;
        }
        if let Some(strategy) = self.port_allocation_strategy {
            config.port_allocation_strategy = strategy;
        }
        if self.port_allocation_seed.is_some() {
            config.port_allocation_seed = self.port_allocation_seed;
        }
        if let Some(interval) = self.interval {
            config.reconcile_interval_secs = interval;
        }
        if let Some(limits) = self.graceful_shutdown_limits {
            config.graceful_shutdown_limits = limits;
        }
        config
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Summarize the effective configuration for the startup log.
pub fn format_startup(config: &ControllerConfig, args: &Args) -> String {
    let mut output = String::new();
    output.push_str(&format!("cacheplane v{}\n", env!("CARGO_PKG_VERSION")));
    output.push_str(&format!(
        "  ports:    {} ({:?})\n",
        config.port_range, config.port_allocation_strategy
    ));
    output.push_str(&format!(
        "  interval: {}s{}\n",
        config.reconcile_interval_secs,
        if args.once { " (single pass)" } else { "" }
    ));
    output.push_str(&format!(
        "  shutdown: {} cache cleanup attempts, exec timeout {}s\n",
        config.graceful_shutdown_limits, config.exec_timeout_secs
    ));
    if let Some(seed) = &args.seed {
        output.push_str(&format!("  seed:     {}\n", seed.display()));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = Args::parse_from([
            "cacheplane",
            "--seed",
            "cluster.yaml",
            "--port-range",
            "14000-14003",
            "--once",
            "-vv",
        ]);
        assert_eq!(args.seed, Some(PathBuf::from("cluster.yaml")));
        assert_eq!(args.port_range, Some(PortRange::new(14000, 14003).unwrap()));
        assert!(args.once);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_bad_port_range_rejected() {
        let result = Args::try_parse_from(["cacheplane", "--port-range", "9-1"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from(["cacheplane", "--interval", "3", "--graceful-shutdown-limits", "1"]);
        let config = args.apply_overrides(ControllerConfig::default());
        assert_eq!(config.reconcile_interval_secs, 3);
        assert_eq!(config.graceful_shutdown_limits, 1);
        assert_eq!(config.port_range, PortRange::default());
    }

    #[test]
    fn test_strategy_override() {
        let args = Args::parse_from([
            "cacheplane",
            "--port-allocation-strategy",
            "random",
            "--port-allocation-seed",
            "5",
        ]);
        let config = args.apply_overrides(ControllerConfig::default());
        assert_eq!(config.port_allocation_strategy, AllocationStrategy::Random);
        assert_eq!(config.port_allocation_seed, Some(5));

        let result = Args::try_parse_from(["cacheplane", "--port-allocation-strategy", "fifo"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_format_startup() {
        let args = Args::parse_from(["cacheplane", "--once"]);
        let output = format_startup(&ControllerConfig::default(), &args);
        assert!(output.contains("20000-26000"));
        assert!(output.contains("single pass"));
    }
}
