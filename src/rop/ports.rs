/// What a port is busy with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transfer {
    /// client read or write
    Client,
    /// reading a line to spill (write entry)
    LineRead(usize),
    /// writing a filled line (read entry)
    LineWrite(usize),
}

#[derive(Debug, Clone, Default)]
struct Port {
    busy_until: u64,
    transfer: Option<Transfer>,
}

/// A group of cache ports moving `width` bytes per cycle.
#[derive(Debug, Clone)]
pub struct Ports {
    ports: Vec<Port>,
    width: usize,
}

impl Ports {
    #[must_use]
    pub fn new(count: usize, width: usize) -> Self {
        Self {
            ports: vec![Port::default(); count],
            width,
        }
    }

    /// Cycles a port is busy moving `bytes`.
    #[must_use]
    pub fn cycles(&self, bytes: usize) -> u64 {
        bytes.div_ceil(self.width).max(1) as u64
    }

    fn free_port(&self, cycle: u64) -> Option<usize> {
        self.ports
            .iter()
            .position(|port| port.transfer.is_none() && port.busy_until <= cycle)
    }

    #[must_use]
    pub fn has_free(&self, cycle: u64) -> bool {
        self.free_port(cycle).is_some()
    }

    /// Occupies a free port for moving `bytes`.
    ///
    /// Returns `false` if every port is busy.
    pub fn start(&mut self, cycle: u64, bytes: usize, transfer: Transfer) -> bool {
        let Some(idx) = self.free_port(cycle) else {
            return false;
        };
        let busy_until = cycle + self.cycles(bytes);
        let port = &mut self.ports[idx];
        port.busy_until = busy_until;
        port.transfer = Some(transfer);
        true
    }

    /// Releases the ports whose transfer completed by `cycle`.
    pub fn finish(&mut self, cycle: u64) -> Vec<Transfer> {
        self.ports
            .iter_mut()
            .filter(|port| port.busy_until <= cycle)
            .filter_map(|port| port.transfer.take())
            .filter(|transfer| *transfer != Transfer::Client)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Ports, Transfer};

    #[test]
    fn test_ports() {
        let mut ports = Ports::new(2, 64);
        assert_eq!(ports.cycles(1), 1);
        assert_eq!(ports.cycles(256), 4);
        assert!(ports.start(10, 256, Transfer::LineRead(3)));
        assert!(ports.start(10, 4, Transfer::Client));
        assert!(!ports.has_free(10));
        assert!(!ports.start(10, 4, Transfer::Client));

        // client transfers are released silently
        assert!(ports.finish(11).is_empty());
        assert!(ports.has_free(11));
        assert!(ports.finish(13).is_empty());
        assert_eq!(ports.finish(14), vec![Transfer::LineRead(3)]);
        assert!(ports.finish(14).is_empty());
        assert!(ports.start(14, 64, Transfer::LineWrite(0)));
    }
}
