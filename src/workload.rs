//! Synthetic render target workloads.

use crate::{
    address,
    mem_fetch::ByteMask,
    sim::{Error, Simulation},
};
use bitvec::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, clap::ValueEnum)]
pub enum Workload {
    /// fast clear, then read back every line
    CLEAR,
    /// full line writes of a gradient, then a flush
    STREAM,
    /// several passes of masked partial writes and reads
    OVERDRAW,
}

impl std::fmt::Display for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

fn line_addresses(sim: &Simulation, lines: usize) -> impl Iterator<Item = address> {
    let base = sim.cache.config().buffer_address;
    let line_size = sim.cache.line_size() as u64;
    (0..lines as u64).map(move |i| base + i * line_size)
}

/// Pixels of a line where consecutive pixels differ by `step`.
fn gradient(line_size: usize, start: u32, step: u32) -> Vec<u8> {
    (0..(line_size / 4) as u32)
        .flat_map(|i| start.wrapping_add(i * step).to_le_bytes())
        .collect()
}

/// Mask of the pixels covered by a triangle edge in `pass`.
fn coverage(bytes: usize, pass: usize) -> ByteMask {
    let mut mask = bitvec![u8, Lsb0; 0; bytes];
    for pixel in (0..bytes / 4).filter(|pixel| (pixel + pass) % 3 != 0) {
        mask[pixel * 4..pixel * 4 + 4].fill(true);
    }
    mask
}

pub fn run(sim: &mut Simulation, workload: Workload, lines: usize) -> Result<(), Error> {
    log::info!("running {} over {} lines", workload, lines);
    match workload {
        Workload::CLEAR => clear(sim, lines),
        Workload::STREAM => stream(sim, lines),
        Workload::OVERDRAW => overdraw(sim, lines, 3),
    }
}

/// Clears the render target and reads it back.
pub fn clear(sim: &mut Simulation, lines: usize) -> Result<(), Error> {
    sim.reset_state()?;
    let line_size = sim.cache.line_size();
    for addr in line_addresses(sim, lines).collect::<Vec<_>>() {
        let line = sim.fetch(addr, 1)?;
        sim.read(addr, line, line_size)?;
    }
    sim.flush()?;
    Ok(())
}

/// Writes every line completely, without reading memory.
pub fn stream(sim: &mut Simulation, lines: usize) -> Result<(), Error> {
    let line_size = sim.cache.line_size();
    let chunk_size = sim.cache.config().port_width.min(line_size);
    let chunks = line_size / chunk_size;
    for (i, addr) in line_addresses(sim, lines).enumerate().collect::<Vec<_>>() {
        let data = gradient(line_size, i as u32, 1 + (i % 4) as u32);
        let line = sim.allocate(addr, chunks as u32)?;
        for (c, chunk) in data.chunks(chunk_size).enumerate() {
            sim.write(addr + (c * chunk_size) as u64, line, chunk, None)?;
        }
    }
    sim.flush()?;
    sim.save_state()?;
    Ok(())
}

/// Blends `passes` partially covering layers into a cleared render target.
pub fn overdraw(sim: &mut Simulation, lines: usize, passes: usize) -> Result<(), Error> {
    sim.reset_state()?;
    let line_size = sim.cache.line_size();
    let chunk_size = sim.cache.config().port_width.min(line_size);
    let chunks = line_size / chunk_size;
    let addresses: Vec<_> = line_addresses(sim, lines).collect();
    for pass in 0..passes {
        for (i, &addr) in addresses.iter().enumerate() {
            let line = if pass == 0 {
                sim.allocate(addr, chunks as u32)?
            } else {
                let line = sim.fetch(addr, 1 + chunks as u32)?;
                // depth test
                sim.read(addr, line, 4)?;
                line
            };
            let data = gradient(line_size, (pass * lines + i) as u32, 1);
            for (c, chunk) in data.chunks(chunk_size).enumerate() {
                let mask = coverage(chunk.len(), pass + c);
                sim.write(addr + (c * chunk_size) as u64, line, chunk, Some(&mask))?;
            }
        }
    }
    sim.flush()?;
    sim.save_state()?;
    Ok(())
}
