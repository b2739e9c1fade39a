use super::{address, cache, config};
use crate::cache::{replacement, LineId};

/// Tag array.
///
/// A generic `ways x sets` array of fixed size lines with tag and valid
/// bits and a pluggable replacement policy. It knows nothing about memory
/// latency: every operation completes immediately.
///
/// Line data is one contiguous buffer indexed by `(way, set, offset)`.
#[derive(Debug)]
pub struct TagArray {
    pub cache_config: cache::config::Config,
    tags: Vec<address>,
    valid: Vec<bool>,
    data: Vec<u8>,
    policy: Option<Box<dyn replacement::ReplacementPolicy>>,
}

impl TagArray {
    pub fn new(config: &config::Cache) -> Result<Self, config::Error> {
        config.validate("tag array")?;
        let cache_config = cache::config::Config::from(config);
        let total_lines = cache_config.total_lines;
        let policy = replacement::build(
            cache_config.replacement_policy,
            cache_config.num_sets,
            cache_config.associativity,
        );
        log::debug!("tag_array::new({config})");
        Ok(Self {
            tags: vec![0; total_lines],
            valid: vec![false; total_lines],
            data: vec![0; total_lines * cache_config.line_size],
            policy,
            cache_config,
        })
    }

    #[inline]
    #[must_use]
    pub fn ways(&self) -> usize {
        self.cache_config.associativity
    }

    #[inline]
    #[must_use]
    pub fn num_sets(&self) -> usize {
        self.cache_config.num_sets
    }

    #[inline]
    #[must_use]
    pub fn line_size(&self) -> usize {
        self.cache_config.line_size
    }

    #[inline]
    fn index(&self, line: LineId) -> usize {
        assert!(
            line.way < self.ways() && line.set < self.num_sets(),
            "tag array: line {line} out of bounds ({} ways, {} sets)",
            self.ways(),
            self.num_sets()
        );
        line.way * self.num_sets() + line.set
    }

    /// Searches for a valid line holding `addr`.
    ///
    /// Ways are scanned in order, the first match wins.
    #[must_use]
    pub fn search(&self, addr: address) -> Option<LineId> {
        let set = self.cache_config.set_index(addr);
        let tag = self.cache_config.tag(addr);
        let hit = (0..self.ways())
            .map(|way| LineId::new(way, set))
            .find(|&line| {
                let idx = self.index(line);
                self.valid[idx] && self.tags[idx] == tag
            });
        log::trace!(
            "tag_array::search({:#x}) set={} tag={:#x} => {:?}",
            addr,
            set,
            tag,
            hit
        );
        hit
    }

    fn expect_hit(&self, addr: address, call: &str) -> LineId {
        match self.search(addr) {
            Some(line) => line,
            None => panic!("tag array: {call}({addr:#x}) of an address that is not resident"),
        }
    }

    /// Reads the 32-bit word holding `addr`.
    ///
    /// The address must be resident.
    pub fn read(&mut self, addr: address) -> u32 {
        let line = self.expect_hit(addr, "read");
        let offset = self.cache_config.offset(addr) & !3;
        self.touch(line);
        crate::read_u32_le(self.line(line), offset)
    }

    /// Writes the 32-bit word holding `addr`.
    ///
    /// The address must be resident.
    pub fn write(&mut self, addr: address, word: u32) {
        let line = self.expect_hit(addr, "write");
        let offset = self.cache_config.offset(addr) & !3;
        self.touch(line);
        crate::write_u32_le(self.line_mut(line), offset, word);
    }

    /// Selects the way to replace for `addr`.
    ///
    /// Invalid lines are used first, otherwise the replacement policy decides.
    #[must_use]
    pub fn select_victim(&self, addr: address) -> usize {
        let set = self.cache_config.set_index(addr);
        if let Some(way) = (0..self.ways()).find(|&way| !self.is_valid(LineId::new(way, set))) {
            return way;
        }
        match self.policy {
            Some(ref policy) => policy.victim(set),
            None => panic!(
                "tag array: no invalid line in set {set} for {addr:#x} and no replacement policy"
            ),
        }
    }

    /// Installs `addr` into `way` of its set.
    pub fn replace(&mut self, addr: address, way: usize, data: Option<&[u8]>) -> LineId {
        let set = self.cache_config.set_index(addr);
        let line = LineId::new(way, set);
        let idx = self.index(line);
        log::trace!(
            "tag_array::replace({:#x}, {}) old tag={:#x} valid={}",
            addr,
            line,
            self.tags[idx],
            self.valid[idx]
        );
        self.tags[idx] = self.cache_config.tag(addr);
        self.valid[idx] = true;
        if let Some(data) = data {
            self.line_mut(line).copy_from_slice(data);
        }
        if let Some(ref mut policy) = self.policy {
            policy.install(set, way);
        }
        line
    }

    /// Notifies the replacement policy of an access.
    pub fn touch(&mut self, line: LineId) {
        if let Some(ref mut policy) = self.policy {
            policy.touch(line.set, line.way);
        }
    }

    /// Preferred victim of the replacement policy, ignoring invalid lines.
    #[must_use]
    pub fn policy_victim(&self, set: usize) -> Option<usize> {
        self.policy.as_ref().map(|policy| policy.victim(set))
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self, line: LineId) -> bool {
        self.valid[self.index(line)]
    }

    /// Address of the first byte of the line currently held by `line`.
    #[inline]
    #[must_use]
    pub fn line_addr(&self, line: LineId) -> address {
        self.cache_config.addr_of(self.tags[self.index(line)], line.set)
    }

    /// Whether `line` holds `addr`.
    #[must_use]
    pub fn holds(&self, line: LineId, addr: address) -> bool {
        let idx = self.index(line);
        self.valid[idx]
            && self.tags[idx] == self.cache_config.tag(addr)
            && line.set == self.cache_config.set_index(addr)
    }

    #[must_use]
    pub fn line(&self, line: LineId) -> &[u8] {
        let start = self.index(line) * self.line_size();
        &self.data[start..start + self.line_size()]
    }

    pub fn line_mut(&mut self, line: LineId) -> &mut [u8] {
        let line_size = self.line_size();
        let start = self.index(line) * line_size;
        &mut self.data[start..start + line_size]
    }

    /// Invalidates all lines.
    pub fn invalidate(&mut self) {
        self.valid.fill(false);
    }

    /// Invalidates all lines and forgets their tags.
    pub fn reset(&mut self) {
        self.valid.fill(false);
        self.tags.fill(0);
        if let Some(ref mut policy) = self.policy {
            policy.reset();
        }
    }
}
