//! Cycle driver connecting a compressed cache to main memory.

use crate::{
    address, cache::LineId, config, dram::MainMemory, mem_fetch::ByteMask, rop::CompressedCache,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),

    #[error("{what} did not complete within {cycles} cycles")]
    Deadlock { what: String, cycles: u64 },
}

#[derive(Debug)]
pub struct Simulation {
    pub cache: CompressedCache,
    pub mem: MainMemory,
    pub cycle: u64,
    /// cycles an operation may take before it is considered stuck
    pub max_cycles: u64,
}

impl Simulation {
    pub fn new(config: &config::Simulation) -> Result<Self, Error> {
        Ok(Self {
            cache: CompressedCache::new("rop", &config.cache)?,
            mem: MainMemory::new("mem", &config.memory),
            cycle: 0,
            max_cycles: 100_000,
        })
    }

    /// Advances cache and memory by one cycle.
    pub fn step(&mut self) {
        let mem_state = self.mem.state();
        if let Some(fetch) = self.cache.cycle(self.cycle, mem_state) {
            self.mem.accept(self.cycle, fetch);
        }
        if let Some(reply) = self.mem.cycle(self.cycle) {
            self.cache.receive(reply);
        }
        self.cycle += 1;
    }

    /// Steps until `done` holds, checking it before every cycle.
    ///
    /// # Returns
    /// The number of cycles stepped.
    pub fn run_until(
        &mut self,
        what: &str,
        mut done: impl FnMut(&mut Self) -> bool,
    ) -> Result<u64, Error> {
        let start = self.cycle;
        while !done(self) {
            self.check_progress(start, || what.to_string())?;
            self.step();
        }
        Ok(self.cycle - start)
    }

    fn check_progress(&self, start: u64, what: impl FnOnce() -> String) -> Result<(), Error> {
        if self.cycle - start >= self.max_cycles {
            return Err(Error::Deadlock {
                what: what(),
                cycles: self.max_cycles,
            });
        }
        Ok(())
    }

    /// Fetches `addr`, retrying every cycle until a line is reserved.
    pub fn fetch(&mut self, addr: address, reserves: u32) -> Result<LineId, Error> {
        let start = self.cycle;
        loop {
            match self.cache.fetch(addr, reserves) {
                Ok(line) => return Ok(line),
                Err(failure) => {
                    self.check_progress(start, || format!("fetch({addr:#x}) => {failure}"))?;
                }
            }
            self.step();
        }
    }

    /// Allocates `addr`, retrying every cycle until a line is reserved.
    pub fn allocate(&mut self, addr: address, reserves: u32) -> Result<LineId, Error> {
        let start = self.cycle;
        loop {
            match self.cache.allocate(addr, reserves) {
                Ok(line) => return Ok(line),
                Err(failure) => {
                    self.check_progress(start, || format!("allocate({addr:#x}) => {failure}"))?;
                }
            }
            self.step();
        }
    }

    pub fn read(&mut self, addr: address, line: LineId, size: usize) -> Result<Vec<u8>, Error> {
        let mut data = vec![0; size];
        self.run_until(&format!("read({addr:#x})"), |sim| {
            sim.cache.read(addr, line, &mut data)
        })?;
        Ok(data)
    }

    pub fn write(
        &mut self,
        addr: address,
        line: LineId,
        data: &[u8],
        mask: Option<&ByteMask>,
    ) -> Result<(), Error> {
        self.run_until(&format!("write({addr:#x})"), |sim| {
            sim.cache.write(addr, line, data, mask)
        })?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<u64, Error> {
        self.run_until("flush", |sim| !sim.cache.flush())
    }

    pub fn save_state(&mut self) -> Result<u64, Error> {
        self.run_until("save state", |sim| !sim.cache.save_state())
    }

    pub fn restore_state(&mut self) -> Result<u64, Error> {
        self.run_until("restore state", |sim| !sim.cache.restore_state())
    }

    pub fn reset_state(&mut self) -> Result<u64, Error> {
        self.run_until("reset state", |sim| !sim.cache.reset_state())
    }
}
