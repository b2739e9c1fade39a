#![allow(non_camel_case_types, clippy::upper_case_acronyms)]

pub mod cache;
pub mod mem;
pub mod sim;

pub use cache::Cache;
pub use mem::Traffic;
pub use sim::Sim;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub sim: Sim,
    pub cache: Cache,
    pub traffic: Traffic,
}

impl std::ops::AddAssign for Stats {
    fn add_assign(&mut self, other: Self) {
        self.sim += other.sim;
        self.cache += other.cache;
        self.traffic += other.traffic;
    }
}
