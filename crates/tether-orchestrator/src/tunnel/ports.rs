//! Tunnel port allocation

use dashmap::DashSet;

use tether_core::error::TunnelError;

/// Hands out ports from an inclusive range
pub struct PortAllocator {
    start: u16,
    end: u16,
    in_use: DashSet<u16>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            in_use: DashSet::new(),
        }
    }

    /// Lowest free port in the range
    pub fn allocate(&self) -> Result<u16, TunnelError> {
        (self.start..=self.end)
            .find(|port| self.in_use.insert(*port))
            .ok_or(TunnelError::PortsExhausted {
                start: self.start,
                end: self.end,
            })
    }

    pub fn release(&self, port: u16) {
        self.in_use.remove(&port);
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_lowest_free() {
        let ports = PortAllocator::new(47100, 47102);
        assert_eq!(ports.allocate().unwrap(), 47100);
        assert_eq!(ports.allocate().unwrap(), 47101);

        ports.release(47100);
        assert_eq!(ports.allocate().unwrap(), 47100);
        assert_eq!(ports.in_use(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let ports = PortAllocator::new(5000, 5000);
        ports.allocate().unwrap();
        assert!(matches!(
            ports.allocate(),
            Err(TunnelError::PortsExhausted { start: 5000, end: 5000 })
        ));
    }
}
