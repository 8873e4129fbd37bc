// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Source-address sets and their algebra.
//!
//! The record-processing rules of RFC 3376 section 6.4 / RFC 3810 section 7.4
//! are written in terms of set union, intersection, and difference over
//! per-group source lists. `SourceList` provides those operators both as
//! owning binary forms (`+`, `*`, `-`) and as in-place forms (`+=`, `*=`,
//! `-=`), matching how the transition rules mutate their operands.
//!
//! Storage is a sorted set: lists are small (rarely more than a few dozen
//! sources) and diagnostic rendering wants a stable order.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::ops::{Add, AddAssign, Mul, MulAssign, Sub, SubAssign};

/// An unordered set of source addresses with set-algebra operators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceList {
    sources: BTreeSet<IpAddr>,
}

impl SourceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, addr: IpAddr) -> bool {
        self.sources.insert(addr)
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.sources.contains(addr)
    }

    /// True if the list names a wildcard source ("0.0.0.0" or "::").
    pub fn contains_wildcard(&self) -> bool {
        self.sources.iter().any(|addr| addr.is_unspecified())
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn clear(&mut self) {
        self.sources.clear()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.sources.iter()
    }
}

impl FromIterator<IpAddr> for SourceList {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        Self {
            sources: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for SourceList {
    type Item = IpAddr;
    type IntoIter = std::collections::btree_set::IntoIter<IpAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.sources.into_iter()
    }
}

impl<'a> IntoIterator for &'a SourceList {
    type Item = &'a IpAddr;
    type IntoIter = std::collections::btree_set::Iter<'a, IpAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.sources.iter()
    }
}

// Union
impl AddAssign<&SourceList> for SourceList {
    fn add_assign(&mut self, rhs: &SourceList) {
        self.sources.extend(rhs.sources.iter().copied());
    }
}

impl Add<&SourceList> for &SourceList {
    type Output = SourceList;

    fn add(self, rhs: &SourceList) -> SourceList {
        SourceList {
            sources: self.sources.union(&rhs.sources).copied().collect(),
        }
    }
}

// Intersection
impl MulAssign<&SourceList> for SourceList {
    fn mul_assign(&mut self, rhs: &SourceList) {
        self.sources.retain(|addr| rhs.sources.contains(addr));
    }
}

impl Mul<&SourceList> for &SourceList {
    type Output = SourceList;

    fn mul(self, rhs: &SourceList) -> SourceList {
        SourceList {
            sources: self.sources.intersection(&rhs.sources).copied().collect(),
        }
    }
}

// Difference
impl SubAssign<&SourceList> for SourceList {
    fn sub_assign(&mut self, rhs: &SourceList) {
        self.sources.retain(|addr| !rhs.sources.contains(addr));
    }
}

impl Sub<&SourceList> for &SourceList {
    type Output = SourceList;

    fn sub(self, rhs: &SourceList) -> SourceList {
        SourceList {
            sources: self.sources.difference(&rhs.sources).copied().collect(),
        }
    }
}

impl std::fmt::Display for SourceList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for addr in &self.sources {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{addr}")?;
            first = false;
        }
        write!(f, "}}")
    }
}
