//! IPv4 CIDR index arithmetic
//!
//! Maps every *usable* address of a prefix (network and broadcast excluded)
//! onto a dense zero-based index, and back. The index space is the unit the
//! pool ledgers allocate in: slot `i` of a ledger always means
//! `cidr.address_at(i)`.
//!
//! All arithmetic is exact unsigned integer math; counts are `u64` so `/0`
//! and `/1` prefixes do not overflow.
//!
//! # Example
//!
//! ```
//! use ipcidr::Cidr;
//!
//! let cidr = Cidr::parse("192.168.2.0/24")?;
//! assert_eq!(cidr.usable_count(), 254);
//! assert_eq!(cidr.address_at(0)?.to_string(), "192.168.2.1");
//! assert_eq!(cidr.index_of("192.168.2.254".parse().unwrap())?, 253);
//! # Ok::<(), ipcidr::CidrError>(())
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

/// Errors produced by CIDR parsing and index arithmetic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CidrError {
    /// The prefix string could not be parsed.
    #[error("invalid CIDR prefix {prefix:?}: {reason}")]
    InvalidPrefix {
        /// The offending input.
        prefix: String,
        /// Why parsing failed.
        reason: String,
    },

    /// The address is the network/broadcast address or outside the prefix.
    #[error("address {addr} is not a usable address of {cidr}")]
    NotInRange {
        /// The offending address.
        addr: Ipv4Addr,
        /// The prefix it was checked against.
        cidr: String,
    },

    /// The index is past the end of the usable range.
    #[error("index {index} out of range, {cidr} has {usable} usable addresses")]
    IndexOutOfRange {
        /// The offending index.
        index: u64,
        /// The prefix it was checked against.
        cidr: String,
        /// Number of usable addresses in the prefix.
        usable: u64,
    },

    /// The prefix cannot be split by the requested factor.
    #[error("cannot split {cidr} into {factor} subnets: {reason}")]
    InvalidSplit {
        /// The prefix that was to be split.
        cidr: String,
        /// The requested factor.
        factor: u64,
        /// Why the split is impossible.
        reason: String,
    },

    /// The prefixes cannot be merged into one.
    #[error("cannot merge prefixes: {0}")]
    InvalidMerge(String),
}

/// An immutable IPv4 prefix with index arithmetic over its usable addresses.
///
/// Index 0 is the first address after the network address; the broadcast
/// address is never indexed. The mapping is bijective and ordered by
/// address value ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    network: u32,
    prefix_len: u8,
}

impl Cidr {
    /// Parses a prefix string such as `"192.168.2.0/24"`.
    ///
    /// Host bits in the address part are masked off, so
    /// `"192.168.2.7/24"` yields the same value as `"192.168.2.0/24"`.
    pub fn parse(prefix: &str) -> Result<Self, CidrError> {
        let invalid = |reason: &str| CidrError::InvalidPrefix {
            prefix: prefix.to_string(),
            reason: reason.to_string(),
        };

        let (addr_part, len_part) = prefix
            .split_once('/')
            .ok_or_else(|| invalid("missing '/'"))?;
        let addr = Ipv4Addr::from_str(addr_part.trim())
            .map_err(|e| invalid(&e.to_string()))?;
        let prefix_len: u8 = len_part
            .trim()
            .parse()
            .map_err(|_| invalid("prefix length is not a number"))?;
        if prefix_len > 32 {
            return Err(invalid("prefix length exceeds 32"));
        }

        let mask = mask_of(prefix_len);
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix_len,
        })
    }

    /// The mask length of the prefix.
    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Total number of addresses covered by the prefix.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        1u64 << (32 - self.prefix_len)
    }

    /// Number of usable addresses: total minus network and broadcast.
    ///
    /// Zero for /31 and /32, which carry no usable host addresses under
    /// this scheme.
    #[must_use]
    pub fn usable_count(&self) -> u64 {
        self.total_count().saturating_sub(2)
    }

    /// The network address of the prefix.
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    /// The broadcast address of the prefix.
    #[must_use]
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network | !mask_of(self.prefix_len))
    }

    /// The lowest usable address (index 0), if the prefix has one.
    #[must_use]
    pub fn min_usable(&self) -> Option<Ipv4Addr> {
        (self.usable_count() > 0).then(|| Ipv4Addr::from(self.network + 1))
    }

    /// The highest usable address (index `usable_count() - 1`), if any.
    #[must_use]
    pub fn max_usable(&self) -> Option<Ipv4Addr> {
        (self.usable_count() > 0)
            .then(|| Ipv4Addr::from((self.network | !mask_of(self.prefix_len)) - 1))
    }

    /// Whether the address falls inside the prefix (network and broadcast
    /// included).
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask_of(self.prefix_len) == self.network
    }

    /// Index of a usable address within the prefix.
    ///
    /// Fails with [`CidrError::NotInRange`] for the network address, the
    /// broadcast address, and anything outside the prefix.
    pub fn index_of(&self, addr: Ipv4Addr) -> Result<u64, CidrError> {
        let value = u32::from(addr);
        if !self.contains(addr) || value == self.network || addr == self.broadcast() {
            return Err(CidrError::NotInRange {
                addr,
                cidr: self.to_string(),
            });
        }
        Ok(u64::from(value - self.network) - 1)
    }

    /// Usable address at the given index.
    ///
    /// Fails with [`CidrError::IndexOutOfRange`] for `index >= usable_count()`.
    pub fn address_at(&self, index: u64) -> Result<Ipv4Addr, CidrError> {
        if index >= self.usable_count() {
            return Err(CidrError::IndexOutOfRange {
                index,
                cidr: self.to_string(),
                usable: self.usable_count(),
            });
        }
        // index + 1 <= usable_count <= 2^32 - 2, so the offset fits u32
        let offset = index as u32 + 1;
        Ok(Ipv4Addr::from(self.network + offset))
    }

    /// Lazy iterator over `(index, address)` pairs in ascending address
    /// order, skipping network and broadcast. Finite and restartable:
    /// every call starts a fresh pass.
    #[must_use]
    pub fn iter_usable(&self) -> UsableAddrs {
        UsableAddrs {
            cidr: *self,
            next: 0,
        }
    }

    /// Splits the prefix into `factor` equal subnets.
    ///
    /// `factor` must be a power of two, and the resulting mask must not
    /// exceed /32.
    pub fn split(&self, factor: u64) -> Result<Vec<Cidr>, CidrError> {
        let invalid = |reason: &str| CidrError::InvalidSplit {
            cidr: self.to_string(),
            factor,
            reason: reason.to_string(),
        };

        if factor == 0 || !factor.is_power_of_two() {
            return Err(invalid("factor is not a power of two"));
        }
        let extra_bits = factor.trailing_zeros() as u8;
        let new_len = self.prefix_len + extra_bits;
        if new_len > 32 {
            return Err(invalid("resulting mask would exceed /32"));
        }

        let stride = 1u64 << (32 - new_len);
        let subnets = (0..factor)
            .map(|i| Cidr {
                network: self.network + (i * stride) as u32,
                prefix_len: new_len,
            })
            .collect();
        Ok(subnets)
    }

    /// Merges contiguous sibling prefixes into one covering prefix.
    ///
    /// All inputs must share one mask length, form a contiguous run whose
    /// length is a power of two, and start on a boundary aligned to the
    /// merged size.
    pub fn merge(cidrs: &[Cidr]) -> Result<Cidr, CidrError> {
        let first = cidrs
            .first()
            .ok_or_else(|| CidrError::InvalidMerge("no prefixes given".to_string()))?;
        if cidrs.iter().any(|c| c.prefix_len != first.prefix_len) {
            return Err(CidrError::InvalidMerge(
                "prefixes differ in mask length".to_string(),
            ));
        }

        let count = cidrs.len() as u64;
        if !count.is_power_of_two() {
            return Err(CidrError::InvalidMerge(format!(
                "{count} prefixes cannot form a power-of-two block"
            )));
        }

        let mut sorted: Vec<&Cidr> = cidrs.iter().collect();
        sorted.sort_by_key(|c| c.network);
        let block = first.total_count();
        for pair in sorted.windows(2) {
            if u64::from(pair[1].network) != u64::from(pair[0].network) + block {
                return Err(CidrError::InvalidMerge(format!(
                    "{} and {} are not contiguous",
                    pair[0], pair[1]
                )));
            }
        }

        let merged_bits = count.trailing_zeros() as u8;
        if merged_bits > first.prefix_len {
            return Err(CidrError::InvalidMerge(format!(
                "{count} /{} prefixes exceed the address space",
                first.prefix_len
            )));
        }
        let new_len = first.prefix_len - merged_bits;
        let start = sorted[0].network;
        if start & mask_of(new_len) != start {
            return Err(CidrError::InvalidMerge(format!(
                "run starting at {} is not aligned to a /{new_len} boundary",
                Ipv4Addr::from(start)
            )));
        }

        Ok(Cidr {
            network: start,
            prefix_len: new_len,
        })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cidr::parse(s)
    }
}

/// Iterator over the usable addresses of a [`Cidr`], see
/// [`Cidr::iter_usable`].
#[derive(Debug, Clone)]
pub struct UsableAddrs {
    cidr: Cidr,
    next: u64,
}

impl Iterator for UsableAddrs {
    type Item = (u64, Ipv4Addr);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next;
        let addr = self.cidr.address_at(index).ok()?;
        self.next += 1;
        Some((index, addr))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.cidr.usable_count().saturating_sub(self.next);
        let hint = usize::try_from(remaining).ok();
        (hint.unwrap_or(usize::MAX), hint)
    }
}

fn mask_of(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    }
}
