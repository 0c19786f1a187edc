// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! CPU partitions.
//!
//! The host CPUs are grouped into partitions ("cpts"). Every sharded structure has one
//! slot per partition and the calling thread works on the slot of the partition that
//! owns its CPU. The layout is decided once, when the network comes up.

use crate::errors::ConfigError;
use crate::nid::Nid;
use std::fmt::{Display, Formatter};

tracectl::trace_target!("cpt", tracectl::LevelFilter::INFO, &["lnet"]);

/// Upper bound on the number of partitions
pub const CPT_MAX: usize = 256;

const GOLDEN_RATIO_PRIME_64: u64 = 0x9e37_ffff_fffc_0001;

/// Multiplicative hash of `val` keeping the top `bits` bits
#[must_use]
pub fn hash_long(val: u64, bits: u32) -> u64 {
    if bits == 0 {
        return 0;
    }
    val.wrapping_mul(GOLDEN_RATIO_PRIME_64) >> (64 - bits.min(64))
}

/// Mapping of CPUs to partitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CptTable {
    parts: Vec<Vec<usize>>,
    cpu_to_cpt: Vec<Option<usize>>,
    bits: u32,
}

impl CptTable {
    fn from_parts(parts: Vec<Vec<usize>>) -> Result<Self, ConfigError> {
        if parts.is_empty() || parts.len() > CPT_MAX {
            return Err(ConfigError::Partitions(format!(
                "{} partitions, expected 1..={CPT_MAX}",
                parts.len()
            )));
        }
        if let Some(empty) = parts.iter().position(Vec::is_empty) {
            return Err(ConfigError::Partitions(format!("partition {empty} has no cpu")));
        }
        let ncpus = parts.iter().flatten().max().map_or(0, |max| max + 1);
        let mut cpu_to_cpt = vec![None; ncpus];
        for (cpt, cpus) in parts.iter().enumerate() {
            for &cpu in cpus {
                if cpu_to_cpt[cpu].replace(cpt).is_some() {
                    return Err(ConfigError::Partitions(format!(
                        "cpu {cpu} is in more than one partition"
                    )));
                }
            }
        }
        let mut bits = 0;
        while (1usize << bits) < parts.len() {
            bits += 1;
        }
        Ok(Self {
            parts,
            cpu_to_cpt,
            bits,
        })
    }

    /// A single partition holding every CPU
    #[must_use]
    pub fn single() -> Self {
        let ncpus = std::thread::available_parallelism().map_or(1, std::num::NonZero::get);
        Self {
            parts: vec![(0..ncpus).collect()],
            cpu_to_cpt: vec![Some(0); ncpus],
            bits: 0,
        }
    }

    /// Split `ncpus` CPUs into `nparts` contiguous partitions of even size.
    ///
    /// # Errors
    ///
    /// Fails if `nparts` is zero, larger than [`CPT_MAX`] or larger than `ncpus`.
    pub fn new(ncpus: usize, nparts: usize) -> Result<Self, ConfigError> {
        if nparts == 0 || nparts > ncpus {
            return Err(ConfigError::Partitions(format!(
                "cannot split {ncpus} cpus into {nparts} partitions"
            )));
        }
        let per = ncpus / nparts;
        let extra = ncpus % nparts;
        let mut parts = Vec::with_capacity(nparts);
        let mut next = 0;
        for cpt in 0..nparts {
            let size = per + usize::from(cpt < extra);
            parts.push((next..next + size).collect());
            next += size;
        }
        Self::from_parts(parts)
    }

    /// Build an explicit layout from a pattern such as `"0[0,1] 1[2-3]"`.
    ///
    /// # Errors
    ///
    /// Fails on malformed patterns, partitions listed out of order, empty partitions
    /// and CPUs listed twice.
    pub fn from_pattern(pattern: &str) -> Result<Self, ConfigError> {
        let bad = |why: &str| ConfigError::Partitions(format!("'{pattern}': {why}"));
        let mut parts: Vec<Vec<usize>> = vec![];
        let mut rest = pattern.trim();
        while !rest.is_empty() {
            let open = rest.find('[').ok_or_else(|| bad("expected '['"))?;
            let close = rest.find(']').ok_or_else(|| bad("expected ']'"))?;
            if close < open {
                return Err(bad("unbalanced brackets"));
            }
            let cpt: usize = rest[..open]
                .trim()
                .parse()
                .map_err(|_| bad("bad partition number"))?;
            if cpt != parts.len() {
                return Err(bad("partitions must be listed in order"));
            }
            let cpus = parse_list(&rest[open + 1..close]).ok_or_else(|| bad("bad cpu list"))?;
            parts.push(cpus);
            rest = rest[close + 1..].trim_start();
        }
        Self::from_parts(parts)
    }

    /// Decide the layout from the configured options and the host CPUs.
    ///
    /// # Errors
    ///
    /// Propagates errors of [`CptTable::from_pattern`] and [`CptTable::new`].
    pub fn detect(npartitions: Option<usize>, pattern: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(pattern) = pattern {
            return Self::from_pattern(pattern);
        }
        match npartitions {
            None | Some(1) => Ok(Self::single()),
            Some(nparts) => {
                let ncpus = std::thread::available_parallelism().map_or(1, std::num::NonZero::get);
                Self::new(ncpus, nparts)
            }
        }
    }

    /// Number of partitions
    #[must_use]
    pub fn count(&self) -> usize {
        self.parts.len()
    }

    /// Bits needed to encode a partition id
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// CPUs of partition `cpt`
    #[must_use]
    pub fn cpus(&self, cpt: usize) -> &[usize] {
        self.parts.get(cpt).map_or(&[], Vec::as_slice)
    }

    /// The partition owning `cpu`, if any
    #[must_use]
    pub fn cpt_of_cpu(&self, cpu: usize) -> Option<usize> {
        self.cpu_to_cpt.get(cpu).copied().flatten()
    }

    /// The partition of the calling thread, 0 when its CPU is unknown
    #[must_use]
    pub fn current(&self) -> usize {
        if self.count() == 1 {
            return 0;
        }
        nix::sched::sched_getcpu()
            .ok()
            .and_then(|cpu| self.cpt_of_cpu(cpu))
            .unwrap_or(0)
    }

    /// Map a 64-bit key onto a partition
    #[must_use]
    pub fn cpt_of_hash(&self, key: u64) -> usize {
        let count = self.count() as u64;
        if count == 1 {
            return 0;
        }
        let val = hash_long(key, self.bits);
        let cpt = if val < count {
            val
        } else {
            key.wrapping_add(val).wrapping_add(val >> 1) % count
        };
        #[allow(clippy::cast_possible_truncation)]
        let cpt = cpt as usize;
        cpt
    }

    /// The partition peers and resources keyed by `nid` live on
    #[must_use]
    pub fn cpt_of_nid(&self, nid: Nid) -> usize {
        self.cpt_of_hash(nid.raw())
    }
}

impl Default for CptTable {
    fn default() -> Self {
        Self::single()
    }
}

impl Display for CptTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (cpt, cpus) in self.parts.iter().enumerate() {
            if cpt > 0 {
                write!(f, " ")?;
            }
            let cpus: Vec<String> = cpus.iter().map(ToString::to_string).collect();
            write!(f, "{cpt}[{}]", cpus.join(","))?;
        }
        Ok(())
    }
}

/// Parse `"0,2-4"` into `[0, 2, 3, 4]`
fn parse_list(list: &str) -> Option<Vec<usize>> {
    let mut out = vec![];
    for item in list.split(',').map(str::trim) {
        match item.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().ok()?;
                let hi: usize = hi.trim().parse().ok()?;
                if lo > hi {
                    return None;
                }
                out.extend(lo..=hi);
            }
            None => out.push(item.parse().ok()?),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn even_split() {
        let table = CptTable::new(7, 3).unwrap();
        assert_eq!(table.count(), 3);
        assert_eq!(table.cpus(0), &[0, 1, 2]);
        assert_eq!(table.cpus(1), &[3, 4]);
        assert_eq!(table.cpus(2), &[5, 6]);
        assert_eq!(table.bits(), 2);
        assert_eq!(table.cpt_of_cpu(4), Some(1));
        assert_eq!(table.cpt_of_cpu(7), None);
        assert!(CptTable::new(2, 3).is_err());
        assert!(CptTable::new(2, 0).is_err());
    }

    #[test]
    fn patterns() {
        let table = CptTable::from_pattern("0[0,1] 1[2-3]").unwrap();
        assert_eq!(table.count(), 2);
        assert_eq!(table.cpus(1), &[2, 3]);
        assert_eq!(table.bits(), 1);
        assert_eq!(table.to_string(), "0[0,1] 1[2,3]");
        assert!(CptTable::from_pattern("1[0]").is_err());
        assert!(CptTable::from_pattern("0[0] 1[0]").is_err());
        assert!(CptTable::from_pattern("0[]").is_err());
        assert!(CptTable::from_pattern("0[3-1]").is_err());
        assert!(CptTable::from_pattern("").is_err());
    }

    #[test]
    fn one_partition_hashes_to_zero() {
        let table = CptTable::single();
        assert_eq!(table.current(), 0);
        for key in [0, 1, 42, u64::MAX] {
            assert_eq!(table.cpt_of_hash(key), 0);
        }
    }

    #[test]
    fn hash_stays_in_range() {
        let table = CptTable::new(12, 3).unwrap();
        bolero::check!().with_type().cloned().for_each(|key: u64| {
            assert!(table.cpt_of_hash(key) < 3);
        });
    }

    #[test]
    fn hash_long_bits() {
        assert_eq!(hash_long(12345, 0), 0);
        bolero::check!()
            .with_type()
            .cloned()
            .for_each(|(key, bits): (u64, u8)| {
                let bits = u32::from(bits % 16) + 1;
                assert!(hash_long(key, bits) < (1 << bits));
            });
    }
}
