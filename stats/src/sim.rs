use serde::{Deserialize, Serialize};

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sim {
    pub cycles: u64,
    /// Cycles in which the request queue had a request that could not be accepted.
    pub request_stall_cycles: u64,
    /// Cycles in which the memory bus was transferring data.
    pub bus_busy_cycles: u64,
}

impl std::ops::AddAssign for Sim {
    fn add_assign(&mut self, other: Self) {
        self.cycles += other.cycles;
        self.request_stall_cycles += other.request_stall_cycles;
        self.bus_busy_cycles += other.bus_busy_cycles;
    }
}
