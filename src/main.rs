use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use console::style;
use ropcachesim::{config, sim::Simulation, workload::Workload};
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// Simulation config (yaml or json)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Workload to run
    #[arg(short, long, value_enum, default_value = "overdraw")]
    workload: Workload,
    /// Number of render target lines
    #[arg(short, long, default_value_t = 256)]
    lines: usize,
    /// Cycles a single operation may take
    #[arg(long, default_value_t = 1_000_000)]
    cycles: u64,
    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn load_config(path: &Path) -> eyre::Result<config::Simulation> {
    let reader = std::io::BufReader::new(
        std::fs::File::open(path).wrap_err_with(|| format!("failed to open {}", path.display()))?,
    );
    let config = match path.extension().and_then(std::ffi::OsStr::to_str) {
        Some("json") => serde_json::from_reader(reader)?,
        _ => serde_yaml::from_reader(reader)?,
    };
    Ok(config)
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let options = Options::parse();

    let log_level = match options.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let config = match options.config {
        Some(ref path) => load_config(path)?,
        None => config::Simulation::default(),
    };
    log::info!("cache: {}", config.cache.cache);

    let mut sim = Simulation::new(&config)?;
    sim.max_cycles = options.cycles;

    let start = std::time::Instant::now();
    ropcachesim::workload::run(&mut sim, options.workload, options.lines)?;
    let mut stats = sim.cache.stats();
    stats.cache.shave();

    eprintln!(
        "{} {} lines in {} cycles ({:?})",
        style(options.workload).cyan(),
        options.lines,
        sim.cycle,
        start.elapsed()
    );
    eprintln!(
        "memory traffic: {} ({} read, {} written)",
        style(human_bytes::human_bytes(stats.traffic.total_bytes() as f64)).red(),
        human_bytes::human_bytes(stats.traffic.bytes_read as f64),
        human_bytes::human_bytes(stats.traffic.bytes_written as f64),
    );
    eprintln!(
        "hit rate: {:.2}%",
        style(stats.cache.hit_rate() * 100.0).cyan()
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
