//! Address selection policies.
//!
//! A [`Strategy`] picks one address from the free sequence produced by
//! [`free_addresses`](crate::address_space::free_addresses). The free
//! sequence is in CIDR order; `in_use` is consulted again so a strategy
//! never returns an address some active allocation holds, even when handed
//! a stale sequence.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Strategy name recorded on allocations created by a reservation.
pub const MANUAL_STRATEGY: &str = "manual";

/// How the engine chooses among free addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Lowest free address in CIDR order.
    #[default]
    FirstFit,
    /// Uniformly random free address.
    Random,
    /// Alias of [`Strategy::FirstFit`]: no last-allocated cursor is kept.
    Sequential,
    /// Address at the middle index of the free sequence.
    LoadBalanced,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::FirstFit,
        Strategy::Random,
        Strategy::Sequential,
        Strategy::LoadBalanced,
    ];

    /// Resolves a strategy by name, falling back to FirstFit for unknown names.
    pub fn from_name(name: &str) -> Self {
        Self::parse(name).unwrap_or_else(|| {
            warn!("Unknown allocation strategy '{}', using first_fit", name);
            Strategy::FirstFit
        })
    }

    /// Strict lookup; returns `None` for unknown names.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "first_fit" => Some(Strategy::FirstFit),
            "random" => Some(Strategy::Random),
            "sequential" => Some(Strategy::Sequential),
            "load_balanced" => Some(Strategy::LoadBalanced),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::FirstFit => "first_fit",
            Strategy::Random => "random",
            Strategy::Sequential => "sequential",
            Strategy::LoadBalanced => "load_balanced",
        }
    }

    /// Picks one address from `free`, skipping anything in `in_use`.
    ///
    /// Returns `None` when no candidate remains.
    pub fn select(&self, free: &[Ipv4Addr], in_use: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        match self {
            Strategy::FirstFit | Strategy::Sequential => {
                free.iter().copied().find(|ip| !in_use.contains(ip))
            }
            Strategy::Random => {
                let candidates = candidates(free, in_use);
                candidates.choose(&mut rand::thread_rng()).copied()
            }
            Strategy::LoadBalanced => {
                let candidates = candidates(free, in_use);
                candidates.get(candidates.len() / 2).copied()
            }
        }
    }
}

fn candidates(free: &[Ipv4Addr], in_use: &HashSet<Ipv4Addr>) -> Vec<Ipv4Addr> {
    free.iter()
        .copied()
        .filter(|ip| !in_use.contains(ip))
        .collect()
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(last_octets: std::ops::RangeInclusive<u8>) -> Vec<Ipv4Addr> {
        last_octets.map(|octet| Ipv4Addr::new(10, 0, 0, octet)).collect()
    }

    #[test]
    fn test_first_fit_picks_lowest() {
        let free = range(1..=5);
        let ip = Strategy::FirstFit.select(&free, &HashSet::new());
        assert_eq!(ip, Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_first_fit_skips_in_use() {
        let free = range(1..=5);
        let in_use: HashSet<_> = [Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
            .into_iter()
            .collect();
        let ip = Strategy::FirstFit.select(&free, &in_use);
        assert_eq!(ip, Some(Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[test]
    fn test_sequential_matches_first_fit() {
        let free = range(7..=20);
        let in_use: HashSet<_> = [Ipv4Addr::new(10, 0, 0, 7)].into_iter().collect();
        assert_eq!(
            Strategy::Sequential.select(&free, &in_use),
            Strategy::FirstFit.select(&free, &in_use)
        );
    }

    #[test]
    fn test_random_returns_member_of_free_set() {
        let free = range(1..=50);
        let in_use: HashSet<_> = range(1..=25).into_iter().collect();
        for _ in 0..100 {
            let ip = Strategy::Random.select(&free, &in_use).unwrap();
            assert!(free.contains(&ip));
            assert!(!in_use.contains(&ip));
        }
    }

    #[test]
    fn test_load_balanced_picks_middle() {
        let free = range(1..=5);
        let ip = Strategy::LoadBalanced.select(&free, &HashSet::new());
        assert_eq!(ip, Some(Ipv4Addr::new(10, 0, 0, 3)));

        let even = range(1..=4);
        let ip = Strategy::LoadBalanced.select(&even, &HashSet::new());
        assert_eq!(ip, Some(Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[test]
    fn test_empty_free_set_returns_none() {
        for strategy in Strategy::ALL {
            assert_eq!(strategy.select(&[], &HashSet::new()), None);
        }
    }

    #[test]
    fn test_all_in_use_returns_none() {
        let free = range(1..=3);
        let in_use: HashSet<_> = free.iter().copied().collect();
        for strategy in Strategy::ALL {
            assert_eq!(strategy.select(&free, &in_use), None);
        }
    }

    #[test]
    fn test_name_resolution() {
        assert_eq!(Strategy::from_name("random"), Strategy::Random);
        assert_eq!(Strategy::from_name("load_balanced"), Strategy::LoadBalanced);
        assert_eq!(Strategy::from_name("Load-Balanced"), Strategy::LoadBalanced);
        assert_eq!(Strategy::from_name("sequential"), Strategy::Sequential);
        assert_eq!(Strategy::from_name("best_fit"), Strategy::FirstFit);
        assert_eq!(Strategy::parse("best_fit"), None);
    }

    #[test]
    fn test_name_roundtrip() {
        for strategy in Strategy::ALL {
            assert_eq!(Strategy::parse(strategy.as_str()), Some(strategy));
        }
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&Strategy::LoadBalanced).unwrap();
        assert_eq!(json, "\"load_balanced\"");
    }
}
