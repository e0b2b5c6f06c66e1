//! VPN address assignment
//!
//! The server owns the first host address; clients get the following ones.

use super::SessionError;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Net {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, SessionError> {
        if !(8..=30).contains(&prefix) {
            return Err(SessionError::InvalidNetwork(format!("unsupported prefix /{prefix}")));
        }
        let mask = u32::MAX << (32 - prefix);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses excluding network and broadcast
    pub fn host_count(&self) -> u32 {
        (1u32 << (32 - self.prefix)) - 2
    }

    /// `n`-th host address, 1-based
    pub fn host(&self, n: u32) -> Option<Ipv4Addr> {
        (n >= 1 && n <= self.host_count()).then(|| Ipv4Addr::from(u32::from(self.network) + n))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::MAX << (32 - self.prefix);
        u32::from(addr) & mask == u32::from(self.network)
    }
}

impl FromStr for Ipv4Net {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SessionError::InvalidNetwork(s.to_string());
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.trim().parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
        Self::new(addr, prefix)
    }
}

#[derive(Debug)]
pub struct AddressPool {
    net: Ipv4Net,
    in_use: Mutex<HashSet<Ipv4Addr>>,
}

impl AddressPool {
    pub fn new(net: Ipv4Net) -> Self {
        Self {
            net,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    pub fn network(&self) -> Ipv4Net {
        self.net
    }

    /// The server's own tunnel address
    pub fn server_address(&self) -> Option<Ipv4Addr> {
        self.net.host(1)
    }

    /// Lowest free client address
    pub fn allocate(&self) -> Result<Ipv4Addr, SessionError> {
        let mut in_use = self.in_use.lock();
        (2..=self.net.host_count())
            .filter_map(|n| self.net.host(n))
            .find(|addr| !in_use.contains(addr))
            .map(|addr| {
                in_use.insert(addr);
                addr
            })
            .ok_or(SessionError::PoolExhausted)
    }

    pub fn release(&self, addr: Ipv4Addr) {
        self.in_use.lock().remove(&addr);
    }

    pub fn allocated(&self) -> usize {
        self.in_use.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network() {
        let net: Ipv4Net = "10.9.0.0/24".parse().unwrap();
        assert_eq!(net.network(), Ipv4Addr::new(10, 9, 0, 0));
        assert_eq!(net.host_count(), 254);
        assert!(net.contains(Ipv4Addr::new(10, 9, 0, 200)));
        assert!(!net.contains(Ipv4Addr::new(10, 9, 1, 1)));

        assert!("10.9.0.0".parse::<Ipv4Net>().is_err());
        assert!("10.9.0.0/31".parse::<Ipv4Net>().is_err());
        assert!("10.0.0.0/4".parse::<Ipv4Net>().is_err());
        assert!("banana/24".parse::<Ipv4Net>().is_err());
    }

    #[test]
    fn test_allocation_order() {
        let pool = AddressPool::new("10.9.0.0/24".parse().unwrap());
        assert_eq!(pool.server_address(), Some(Ipv4Addr::new(10, 9, 0, 1)));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 9, 0, 2));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 9, 0, 3));

        pool.release(Ipv4Addr::new(10, 9, 0, 2));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 9, 0, 2));
    }

    #[test]
    fn test_exhaustion() {
        // /30 has two hosts: server plus one client
        let pool = AddressPool::new("192.168.5.0/30".parse().unwrap());
        assert!(pool.allocate().is_ok());
        assert_eq!(pool.allocate().unwrap_err(), SessionError::PoolExhausted);
    }
}
