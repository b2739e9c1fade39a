use crate::{config, sim::Simulation};

static LOGGER: std::sync::Once = std::sync::Once::new();

pub fn init_logging() {
    LOGGER.call_once(|| {
        env_logger::builder().is_test(true).init();
    });
}

/// Small render target cache: 2 ways of 4 sets with 256 byte lines.
#[must_use]
pub fn small_config() -> config::Simulation {
    let mut config = config::Simulation::default();
    config.cache.cache.ways = 2;
    config.cache.cache.num_sets = 4;
    config.cache.max_blocks = 64;
    config.memory.latency = 10;
    config
}

pub fn simulation(config: &config::Simulation) -> color_eyre::eyre::Result<Simulation> {
    init_logging();
    let sim = Simulation::new(config)?;
    Ok(sim)
}

/// A line of 32-bit pixels all set to `value`.
#[must_use]
pub fn constant_line(value: u32, line_size: usize) -> Vec<u8> {
    value.to_le_bytes().repeat(line_size / 4)
}

/// A line that does not compress.
#[must_use]
pub fn noise_line(seed: u32, line_size: usize) -> Vec<u8> {
    (0..(line_size / 4) as u32)
        .flat_map(|i| (i ^ seed).wrapping_mul(0x9e37_79b9).to_le_bytes())
        .collect()
}
