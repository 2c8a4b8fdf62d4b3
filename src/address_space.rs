//! Address arithmetic over a pool's CIDR.
//!
//! Everything here is a pure function of its inputs. [`free_addresses`] is
//! the only authority on whether an address is currently free; the engine
//! never keeps a free list of its own.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};
use crate::model::{Allocation, Pool, PoolUtilization, ReservedRange};

/// Parses a CIDR string, truncating host bits (`10.0.0.7/24` is `10.0.0.0/24`).
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net> {
    cidr.trim()
        .parse::<Ipv4Net>()
        .map(|network| network.trunc())
        .map_err(|_| Error::InvalidCidr(cidr.to_string()))
}

pub fn parse_address(address: &str) -> Result<Ipv4Addr> {
    address
        .trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| Error::InvalidAddress(address.to_string()))
}

/// First and last usable host address as integers.
///
/// Network and broadcast addresses are excluded, except for /31 and /32
/// networks where every address is a host.
pub fn host_bounds(network: &Ipv4Net) -> (u32, u32) {
    let first = u32::from(network.network());
    let last = u32::from(network.broadcast());
    if network.prefix_len() >= 31 {
        (first, last)
    } else {
        (first + 1, last - 1)
    }
}

pub fn is_host_address(network: &Ipv4Net, ip: Ipv4Addr) -> bool {
    let (first, last) = host_bounds(network);
    let value = u32::from(ip);
    value >= first && value <= last
}

fn total_addresses(network: &Ipv4Net) -> u64 {
    1u64 << (32 - u32::from(network.prefix_len()))
}

fn usable_addresses(network: &Ipv4Net) -> u64 {
    let (first, last) = host_bounds(network);
    u64::from(last - first) + 1
}

/// Shortest prefix a pool may have.
///
/// Free-address computation is linear in the number of hosts, so a pool is
/// capped at a /16 (65534 hosts).
pub const MIN_PREFIX_LEN: u8 = 16;

/// Rejects networks larger than [`MIN_PREFIX_LEN`] allows.
pub fn validate_pool_size(network: &Ipv4Net) -> Result<()> {
    if network.prefix_len() < MIN_PREFIX_LEN {
        return Err(Error::InvalidPool(format!(
            "{} is larger than a /{} pool",
            network, MIN_PREFIX_LEN
        )));
    }
    Ok(())
}

/// Checks that every reserved range is ordered and lies inside the host range.
pub fn validate_reserved_ranges(network: &Ipv4Net, ranges: &[ReservedRange]) -> Result<()> {
    for range in ranges {
        if range.start > range.end {
            return Err(Error::InvalidPool(format!(
                "reserved range {} starts after it ends",
                range
            )));
        }
        if !is_host_address(network, range.start) || !is_host_address(network, range.end) {
            return Err(Error::InvalidPool(format!(
                "reserved range {} is outside the host range of {}",
                range, network
            )));
        }
    }
    Ok(())
}

/// Number of distinct host addresses covered by the reserved ranges.
fn reserved_host_count(network: &Ipv4Net, ranges: &[ReservedRange]) -> u64 {
    let (first, last) = host_bounds(network);
    let mut spans: Vec<(u32, u32)> = ranges
        .iter()
        .map(|range| {
            (
                u32::from(range.start).max(first),
                u32::from(range.end).min(last),
            )
        })
        .filter(|(start, end)| start <= end)
        .collect();
    spans.sort_unstable();

    let mut count = 0u64;
    let mut covered_until: Option<u32> = None;
    for (start, end) in spans {
        let start = match covered_until {
            Some(covered) if covered >= end => continue,
            Some(covered) if covered >= start => covered + 1,
            _ => start,
        };
        count += u64::from(end - start) + 1;
        covered_until = Some(end);
    }
    count
}

/// Addresses held by the active allocations among `allocations`.
pub fn in_use_addresses<'a, I>(allocations: I) -> HashSet<Ipv4Addr>
where
    I: IntoIterator<Item = &'a Allocation>,
{
    allocations
        .into_iter()
        .filter(|allocation| allocation.active)
        .map(|allocation| allocation.address)
        .collect()
}

/// Usable host addresses of `pool` that are neither reserved nor held by an
/// active allocation, in ascending order.
///
/// # Errors
///
/// Returns [`Error::InvalidCidr`] if the pool's CIDR cannot be parsed.
pub fn free_addresses<'a, I>(pool: &Pool, active_allocations: I) -> Result<Vec<Ipv4Addr>>
where
    I: IntoIterator<Item = &'a Allocation>,
{
    let network = pool.network()?;
    let in_use = in_use_addresses(active_allocations);
    let (first, last) = host_bounds(&network);

    Ok((first..=last)
        .map(Ipv4Addr::from)
        .filter(|ip| !pool.is_reserved(*ip) && !in_use.contains(ip))
        .collect())
}

/// Address accounting for `pool`.
///
/// The percentage is computed against usable-minus-reserved with the
/// denominator floored at 1.
pub fn utilization<'a, I>(pool: &Pool, active_allocations: I) -> Result<PoolUtilization>
where
    I: IntoIterator<Item = &'a Allocation>,
{
    let network = pool.network()?;
    let total = total_addresses(&network);
    let usable = usable_addresses(&network);
    let reserved = reserved_host_count(&network, &pool.reserved_ranges);
    let allocated = active_allocations
        .into_iter()
        .filter(|allocation| allocation.active)
        .count() as u64;

    let allocatable = usable.saturating_sub(reserved);
    let percent = allocated as f64 / allocatable.max(1) as f64 * 100.0;

    Ok(PoolUtilization {
        pool_name: pool.name.clone(),
        cidr: pool.cidr.clone(),
        total_addresses: total,
        usable_addresses: usable,
        reserved_addresses: reserved,
        allocated_addresses: allocated,
        available_addresses: allocatable.saturating_sub(allocated),
        utilization_percent: (percent * 100.0).round() / 100.0,
    })
}
