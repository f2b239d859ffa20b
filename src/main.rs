use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use dircache::coherence::CoherenceConfig;
use dircache::sim::config::{Config, SimConfig};
use dircache::sim::top::Sim;
use dircache::sim::trace::Trace;
use log::{info, LevelFilter};
use toml::Table;

#[derive(Parser)]
#[command(version, about)]
struct DircacheArgs {
    #[arg(help = "Path to config.toml")]
    config_path: PathBuf,
    #[arg(long, help = "Override trace path")]
    trace: Option<PathBuf>,
    #[arg(long, help = "Enable log at level (0:none, 1:info, 2:debug, 3:trace)")]
    log: Option<u64>,
    #[arg(long, help = "Write stats as JSON to this path instead of stdout")]
    stats_json: Option<PathBuf>,
}

fn level_filter(level: u64) -> LevelFilter {
    match level {
        0 => LevelFilter::Off,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn main() -> anyhow::Result<()> {
    let argv = DircacheArgs::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if let Some(level) = argv.log {
        logger.filter_level(level_filter(level));
    }
    logger.init();

    let config = fs::read_to_string(&argv.config_path)
        .with_context(|| format!("failed to read config file {}", argv.config_path.display()))?;
    let config_table: Table = toml::from_str(&config).context("cannot parse config toml")?;
    let mut sim_config = SimConfig::from_section(config_table.get("sim"))?;
    let cache_config = CoherenceConfig::from_section(config_table.get("cache"))?;

    // override toml configs with argv
    sim_config.log_level = argv.log.unwrap_or(sim_config.log_level);
    sim_config.trace = argv.trace.or(sim_config.trace);
    sim_config.stats_json = argv.stats_json.or(sim_config.stats_json);

    let trace_path = sim_config
        .trace
        .clone()
        .context("no trace given in [sim] or with --trace")?;
    let trace = Trace::load(&trace_path)?;
    info!("replaying {} events from {}", trace.len(), trace_path.display());

    let stats_path = sim_config.stats_json.clone();
    let mut sim = Sim::from_trace(sim_config, cache_config, &trace);
    let summary = sim.run()?;

    let report = serde_json::json!({
        "run": summary,
        "cache": sim.stats(),
    });
    let text = serde_json::to_string_pretty(&report).context("cannot serialize stats")?;
    match stats_path {
        Some(path) => fs::write(&path, text)
            .with_context(|| format!("failed to write stats to {}", path.display()))?,
        None => println!("{}", text),
    }
    Ok(())
}
