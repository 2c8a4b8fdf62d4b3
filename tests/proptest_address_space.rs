use std::collections::HashSet;
use std::net::Ipv4Addr;

use chrono::{TimeDelta, Utc};
use proptest::prelude::*;

use leasepool::address_space::{free_addresses, host_bounds, parse_address, utilization};
use leasepool::{
    Allocation, AllocationType, BindingStatus, Lease, Pool, ReservedRange,
    Strategy as AllocationStrategy,
};

fn make_pool(base: u32, prefix: u8, reserved: Vec<ReservedRange>) -> Pool {
    let network = ipnet::Ipv4Net::new(Ipv4Addr::from(base), prefix)
        .unwrap()
        .trunc();
    let now = Utc::now();
    Pool {
        id: 1,
        name: "prop".to_string(),
        cidr: network.to_string(),
        description: None,
        gateway: None,
        dns_servers: vec![],
        reserved_ranges: reserved,
        created_at: now,
        updated_at: now,
        active: true,
    }
}

fn make_allocation(id: u64, address: Ipv4Addr, active: bool) -> Allocation {
    let now = Utc::now();
    Allocation {
        id,
        pool_id: 1,
        address,
        client_id: None,
        client_name: None,
        allocation_type: AllocationType::Dynamic,
        strategy: "first_fit".to_string(),
        assigned_at: now,
        last_seen: now,
        active,
        network_interface: None,
        binding_status: BindingStatus::Unbound,
    }
}

/// A pool plus reserved ranges and allocations expressed as host offsets.
fn pool_scenario() -> impl Strategy<Value = (Pool, Vec<Allocation>)> {
    (any::<u32>(), 22u8..=30)
        .prop_flat_map(|(base, prefix)| {
            let hosts = (1u32 << (32 - u32::from(prefix))) - 2;
            (
                Just(base),
                Just(prefix),
                prop::collection::vec((0..hosts, 0..8u32), 0..4),
                prop::collection::vec((0..hosts, any::<bool>()), 0..32),
            )
        })
        .prop_map(|(base, prefix, ranges, allocations)| {
            let bare = make_pool(base, prefix, vec![]);
            let network = bare.network().unwrap();
            let (first, last) = host_bounds(&network);

            let reserved = ranges
                .into_iter()
                .map(|(offset, width)| {
                    let start = first + offset;
                    let end = start.saturating_add(width).min(last);
                    ReservedRange::new(Ipv4Addr::from(start), Ipv4Addr::from(end))
                })
                .collect();

            let mut seen = HashSet::new();
            let allocations = allocations
                .into_iter()
                .filter(|(offset, _)| seen.insert(*offset))
                .enumerate()
                .map(|(index, (offset, active))| {
                    make_allocation(index as u64 + 1, Ipv4Addr::from(first + offset), active)
                })
                .collect();

            (make_pool(base, prefix, reserved), allocations)
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn free_addresses_are_sorted_usable_and_unheld((pool, allocations) in pool_scenario()) {
        let network = pool.network().unwrap();
        let (first, last) = host_bounds(&network);
        let held: HashSet<Ipv4Addr> = allocations
            .iter()
            .filter(|allocation| allocation.active)
            .map(|allocation| allocation.address)
            .collect();

        let free = free_addresses(&pool, &allocations).unwrap();
        prop_assert!(free.windows(2).all(|pair| pair[0] < pair[1]));
        for address in &free {
            let value = u32::from(*address);
            prop_assert!(value >= first && value <= last);
            prop_assert!(!pool.is_reserved(*address));
            prop_assert!(!held.contains(address));
        }
    }

    #[test]
    fn free_and_taken_partition_the_host_range((pool, allocations) in pool_scenario()) {
        let network = pool.network().unwrap();
        let (first, last) = host_bounds(&network);
        let free: HashSet<Ipv4Addr> = free_addresses(&pool, &allocations).unwrap().into_iter().collect();

        for value in first..=last {
            let address = Ipv4Addr::from(value);
            let held = allocations
                .iter()
                .any(|allocation| allocation.active && allocation.address == address);
            prop_assert_eq!(free.contains(&address), !held && !pool.is_reserved(address));
        }
    }

    #[test]
    fn utilization_accounts_for_every_usable_address((pool, allocations) in pool_scenario()) {
        // Only allocations outside reserved ranges keep the arithmetic exact.
        let allocations: Vec<Allocation> = allocations
            .into_iter()
            .filter(|allocation| !pool.is_reserved(allocation.address))
            .collect();

        let usage = utilization(&pool, &allocations).unwrap();
        let free = free_addresses(&pool, &allocations).unwrap();
        prop_assert_eq!(usage.available_addresses, free.len() as u64);
        prop_assert_eq!(
            usage.reserved_addresses + usage.allocated_addresses + usage.available_addresses,
            usage.usable_addresses
        );
        prop_assert!(usage.utilization_percent >= 0.0 && usage.utilization_percent <= 100.0);
    }

    #[test]
    fn every_strategy_selects_a_free_address((pool, allocations) in pool_scenario()) {
        let free = free_addresses(&pool, &allocations).unwrap();
        let in_use: HashSet<Ipv4Addr> = allocations
            .iter()
            .filter(|allocation| allocation.active)
            .map(|allocation| allocation.address)
            .collect();

        for strategy in AllocationStrategy::ALL {
            match strategy.select(&free, &in_use) {
                Some(address) => prop_assert!(free.binary_search(&address).is_ok()),
                None => prop_assert!(free.is_empty()),
            }
        }
    }

    #[test]
    fn parse_address_never_panics(input in ".{0,24}") {
        let _ = parse_address(&input);
    }

    #[test]
    fn lease_expiry_is_strictly_after_end(duration in 0u32..100_000, offset in -200_000i64..200_000) {
        let start = Utc::now();
        let lease = Lease::new(1, 1, 1, start, duration, 3);
        let now = start + TimeDelta::seconds(offset);

        prop_assert_eq!(lease.is_expired_at(now), now > lease.end);
        prop_assert!(lease.remaining_at(now) >= TimeDelta::zero());
        if !lease.is_expired_at(now) {
            prop_assert_eq!(lease.remaining_at(now), lease.end - now);
        }
    }
}
