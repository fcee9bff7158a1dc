use std::net::IpAddr;

use maglb_common::NO_REAL;
use serde::Deserialize;

const OFFSET_SEED: u32 = 42;
const SKIP_SEED: u32 = 2307;
const REAL_HASH_SEED: u32 = 0;

/// A backend as placed on a ring. `hash` seeds the backend's permutation and
/// must be unique per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub num: u32,
    pub weight: u32,
    pub hash: u64,
}

impl Endpoint {
    pub fn for_real(num: u32, weight: u32, addr: IpAddr) -> Self {
        let hash = match addr {
            IpAddr::V4(v4) => mur3::murmurhash3_x64_128(&v4.octets(), REAL_HASH_SEED).0,
            IpAddr::V6(v6) => mur3::murmurhash3_x64_128(&v6.octets(), REAL_HASH_SEED).0,
        };
        Endpoint { num, weight, hash }
    }
}

pub trait ConsistentHasher {
    /// Returns `ring_size` slots, each holding an endpoint `num`, or
    /// [`NO_REAL`] everywhere when `endpoints` is empty.
    fn generate_hash_ring(&self, endpoints: &[Endpoint], ring_size: u32) -> Vec<u32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashFunction {
    #[default]
    Maglev,
    MaglevV2,
}

impl HashFunction {
    pub fn hasher(self) -> Box<dyn ConsistentHasher + Send + Sync> {
        match self {
            HashFunction::Maglev => Box::new(MaglevHasher),
            HashFunction::MaglevV2 => Box::new(MaglevV2Hasher),
        }
    }
}

/// Maglev placement where a backend of weight `w` takes `w` consecutive
/// turns in the first round and one turn in every later round.
pub struct MaglevHasher;

/// Maglev placement where a backend takes a turn whenever its accumulated
/// weight reaches the largest weight, so slot counts follow the weights.
pub struct MaglevV2Hasher;

struct Permutation {
    offset: u64,
    skip: u64,
    next: u64,
}

impl Permutation {
    fn new(endpoint: &Endpoint, ring_size: u32) -> Self {
        let bytes = endpoint.hash.to_le_bytes();
        let offset_hash = mur3::murmurhash3_x64_128(&bytes, OFFSET_SEED).0;
        let skip_hash = mur3::murmurhash3_x64_128(&bytes, SKIP_SEED).0;
        let ring_size = ring_size as u64;
        Permutation {
            offset: offset_hash % ring_size,
            skip: skip_hash % (ring_size - 1) + 1,
            next: 0,
        }
    }

    // Claims the next free slot in this permutation. A prime ring size makes
    // every permutation visit all slots; for other sizes the walk is cut
    // short and the first free slot after it is taken.
    fn claim(&mut self, ring: &mut [u32], num: u32) {
        let ring_size = ring.len() as u64;
        let mut cur = (self.offset + self.next * self.skip) % ring_size;
        let mut steps = 0;
        while ring[cur as usize] != NO_REAL && steps < ring_size {
            self.next += 1;
            steps += 1;
            cur = (self.offset + self.next * self.skip) % ring_size;
        }
        while ring[cur as usize] != NO_REAL {
            cur = (cur + 1) % ring_size;
        }
        ring[cur as usize] = num;
        self.next += 1;
    }
}

// Trivial rings and the sorted endpoint order shared by both variants.
fn prepare(endpoints: &[Endpoint], ring_size: u32) -> Result<Vec<Endpoint>, Vec<u32>> {
    if endpoints.is_empty() || ring_size == 0 {
        return Err(vec![NO_REAL; ring_size as usize]);
    }
    let mut sorted = endpoints.to_vec();
    sorted.sort_by_key(|e| (e.hash, e.num));
    if sorted.len() == 1 || ring_size == 1 {
        return Err(vec![sorted[0].num; ring_size as usize]);
    }
    Ok(sorted)
}

impl ConsistentHasher for MaglevHasher {
    fn generate_hash_ring(&self, endpoints: &[Endpoint], ring_size: u32) -> Vec<u32> {
        let mut endpoints = match prepare(endpoints, ring_size) {
            Ok(e) => e,
            Err(ring) => return ring,
        };
        let mut perms: Vec<_> = endpoints
            .iter()
            .map(|e| Permutation::new(e, ring_size))
            .collect();
        let mut ring = vec![NO_REAL; ring_size as usize];
        let mut runs = 0u32;

        loop {
            for (endpoint, perm) in endpoints.iter_mut().zip(perms.iter_mut()) {
                for _ in 0..endpoint.weight.max(1) {
                    perm.claim(&mut ring, endpoint.num);
                    runs += 1;
                    if runs == ring_size {
                        return ring;
                    }
                }
                endpoint.weight = 1;
            }
        }
    }
}

impl ConsistentHasher for MaglevV2Hasher {
    fn generate_hash_ring(&self, endpoints: &[Endpoint], ring_size: u32) -> Vec<u32> {
        let endpoints = match prepare(endpoints, ring_size) {
            Ok(e) => e,
            Err(ring) => return ring,
        };
        let max_weight = endpoints.iter().map(|e| e.weight).max().unwrap_or(0).max(1);
        let mut perms: Vec<_> = endpoints
            .iter()
            .map(|e| Permutation::new(e, ring_size))
            .collect();
        let mut cum_weight = vec![0u32; endpoints.len()];
        let mut ring = vec![NO_REAL; ring_size as usize];
        let mut runs = 0u32;

        loop {
            for (i, endpoint) in endpoints.iter().enumerate() {
                cum_weight[i] += endpoint.weight.max(1);
                if cum_weight[i] < max_weight {
                    continue;
                }
                cum_weight[i] -= max_weight;
                perms[i].claim(&mut ring, endpoint.num);
                runs += 1;
                if runs == ring_size {
                    return ring;
                }
            }
        }
    }
}

pub fn is_prime(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2u32;
    while (d as u64) * (d as u64) <= n as u64 {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}
