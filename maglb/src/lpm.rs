//! Source-prefix routing tables.
//!
//! Prefixes are stored per length in hash maps keyed by the masked prefix.
//! A lookup probes only the lengths that are populated, longest first, so it
//! costs at most 33 (IPv4) or 129 (IPv6) map lookups.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ahash::AHashMap;
use maglb_common::{V4LpmKey, V6LpmKey};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct LpmTable {
    v4: AHashMap<V4LpmKey, u32>,
    v6: AHashMap<V6LpmKey, u32>,
    v4_lens: [u32; 33],
    v6_lens: [u32; 129],
    max_entries: u32,
}

impl LpmTable {
    pub fn new(max_entries: u32) -> Self {
        LpmTable {
            v4: AHashMap::new(),
            v6: AHashMap::new(),
            v4_lens: [0; 33],
            v6_lens: [0; 129],
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&mut self, prefix: IpAddr, prefixlen: u32, real: u32) -> Result<()> {
        let full = self.len() >= self.max_entries as usize;
        match prefix {
            IpAddr::V4(addr) => {
                let key = V4LpmKey::new(addr, prefixlen);
                if !self.v4.contains_key(&key) {
                    if full {
                        return Err(self.full());
                    }
                    self.v4_lens[key.prefixlen as usize] += 1;
                }
                self.v4.insert(key, real);
            }
            IpAddr::V6(addr) => {
                let key = V6LpmKey::new(addr, prefixlen);
                if !self.v6.contains_key(&key) {
                    if full {
                        return Err(self.full());
                    }
                    self.v6_lens[key.prefixlen as usize] += 1;
                }
                self.v6.insert(key, real);
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, prefix: IpAddr, prefixlen: u32) -> Option<u32> {
        match prefix {
            IpAddr::V4(addr) => {
                let key = V4LpmKey::new(addr, prefixlen);
                let real = self.v4.remove(&key)?;
                self.v4_lens[key.prefixlen as usize] -= 1;
                Some(real)
            }
            IpAddr::V6(addr) => {
                let key = V6LpmKey::new(addr, prefixlen);
                let real = self.v6.remove(&key)?;
                self.v6_lens[key.prefixlen as usize] -= 1;
                Some(real)
            }
        }
    }

    /// Longest matching prefix for `src`.
    pub fn lookup(&self, src: IpAddr) -> Option<u32> {
        match src {
            IpAddr::V4(addr) => self.lookup_v4(addr),
            IpAddr::V6(addr) => self.lookup_v6(addr),
        }
    }

    fn lookup_v4(&self, addr: Ipv4Addr) -> Option<u32> {
        for len in (0..=32u32).rev() {
            if self.v4_lens[len as usize] == 0 {
                continue;
            }
            if let Some(real) = self.v4.get(&V4LpmKey::new(addr, len)) {
                return Some(*real);
            }
        }
        None
    }

    fn lookup_v6(&self, addr: Ipv6Addr) -> Option<u32> {
        for len in (0..=128u32).rev() {
            if self.v6_lens[len as usize] == 0 {
                continue;
            }
            if let Some(real) = self.v6.get(&V6LpmKey::new(addr, len)) {
                return Some(*real);
            }
        }
        None
    }

    fn full(&self) -> Error {
        Error::TableFull {
            table: "source routing",
            max: self.max_entries,
        }
    }
}

/// Parses `addr/len`; a bare address is a host prefix.
pub fn parse_cidr(s: &str) -> Result<(IpAddr, u32)> {
    let (addr, len) = match s.split_once('/') {
        Some((a, l)) => (a, Some(l)),
        None => (s, None),
    };
    let addr: IpAddr = addr
        .trim()
        .parse()
        .map_err(|_| Error::InvalidAddress(s.to_string()))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    let len = match len {
        Some(l) => l
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|l| *l <= max)
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?,
        None => max,
    };
    Ok((addr, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let mut lpm = LpmTable::new(16);
        lpm.insert(ip("10.0.0.0"), 8, 1).unwrap();
        lpm.insert(ip("10.1.0.0"), 16, 2).unwrap();
        lpm.insert(ip("10.1.2.3"), 32, 3).unwrap();

        assert_eq!(lpm.lookup(ip("10.9.9.9")), Some(1));
        assert_eq!(lpm.lookup(ip("10.1.9.9")), Some(2));
        assert_eq!(lpm.lookup(ip("10.1.2.3")), Some(3));
        assert_eq!(lpm.lookup(ip("11.0.0.1")), None);

        assert_eq!(lpm.remove(ip("10.1.0.0"), 16), Some(2));
        assert_eq!(lpm.lookup(ip("10.1.9.9")), Some(1));
    }

    #[test]
    fn v6_prefixes() {
        let mut lpm = LpmTable::new(16);
        lpm.insert(ip("2001:db8::"), 32, 4).unwrap();
        lpm.insert(ip("::"), 0, 5).unwrap();
        assert_eq!(lpm.lookup(ip("2001:db8:1::1")), Some(4));
        assert_eq!(lpm.lookup(ip("2001:db9::1")), Some(5));
        // families do not mix
        assert_eq!(lpm.lookup(ip("10.0.0.1")), None);
    }

    #[test]
    fn table_is_bounded() {
        let mut lpm = LpmTable::new(1);
        lpm.insert(ip("10.0.0.0"), 8, 1).unwrap();
        lpm.insert(ip("10.0.0.0"), 8, 2).unwrap();
        assert!(lpm.insert(ip("2001:db8::"), 32, 1).is_err());
        assert_eq!(lpm.len(), 1);
    }

    #[test]
    fn cidr_parsing() {
        assert_eq!(parse_cidr("10.0.0.0/8").unwrap(), (ip("10.0.0.0"), 8));
        assert_eq!(parse_cidr("2001:db8::1").unwrap(), (ip("2001:db8::1"), 128));
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("nonsense/8").is_err());
    }
}
