//! Persisted record types: pools, allocations and the audit log.
//!
//! Leases live in [`crate::lease`] next to the time arithmetic that governs
//! them. Records reference each other by numeric id (`pool_id`,
//! `allocation_id`), mirroring the four logical tables of the record store.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::address_space;
use crate::error::Result;

/// An inclusive range of addresses that must never be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl ReservedRange {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        ip >= self.start && ip <= self.end
    }
}

impl fmt::Display for ReservedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// An administratively defined CIDR range available for allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: u64,
    /// Unique across pools.
    pub name: String,
    /// Fixed at creation.
    pub cidr: String,
    pub description: Option<String>,
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub reserved_ranges: Vec<ReservedRange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active: bool,
}

impl Pool {
    /// Parses the stored CIDR.
    pub fn network(&self) -> Result<Ipv4Net> {
        address_space::parse_cidr(&self.cidr)
    }

    pub fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        self.reserved_ranges.iter().any(|range| range.contains(ip))
    }
}

/// Parameters for creating a pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPool {
    pub name: String,
    pub cidr: String,
    pub description: Option<String>,
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub reserved_ranges: Vec<ReservedRange>,
}

impl NewPool {
    pub fn new(name: impl Into<String>, cidr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cidr: cidr.into(),
            ..Default::default()
        }
    }
}

/// Metadata changes to an existing pool; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Option<Vec<Ipv4Addr>>,
    pub reserved_ranges: Option<Vec<ReservedRange>>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationType {
    /// Chosen by the engine through a [`Strategy`](crate::Strategy).
    Dynamic,
    /// Requested for a specific address.
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingStatus {
    #[default]
    Unbound,
    Bound,
    Failed,
}

/// A binding of one address to one client within a pool.
///
/// Never removed: releasing or expiring an allocation only clears `active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: u64,
    pub pool_id: u64,
    pub address: Ipv4Addr,
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub allocation_type: AllocationType,
    /// Strategy name, or `"manual"` for reservations.
    pub strategy: String,
    pub assigned_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active: bool,
    pub network_interface: Option<String>,
    #[serde(default)]
    pub binding_status: BindingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Allocate,
    Reserve,
    Deallocate,
    Renew,
    Expire,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditAction::Allocate => "allocate",
            AuditAction::Reserve => "reserve",
            AuditAction::Deallocate => "deallocate",
            AuditAction::Renew => "renew",
            AuditAction::Expire => "expire",
        };
        f.write_str(name)
    }
}

/// Append-only audit record of one engine operation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub pool_id: Option<u64>,
    pub address: Option<Ipv4Addr>,
    pub action: AuditAction,
    pub client_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// A successful attempt. The id is assigned when the entry is appended.
    pub fn success(
        action: AuditAction,
        pool_id: Option<u64>,
        address: Option<Ipv4Addr>,
        client_id: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            pool_id,
            address,
            action,
            client_id,
            success: true,
            error: None,
            details: None,
            timestamp,
        }
    }

    pub fn failure(
        action: AuditAction,
        pool_id: Option<u64>,
        address: Option<Ipv4Addr>,
        client_id: Option<String>,
        error: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::success(action, pool_id, address, client_id, timestamp)
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Address accounting for a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolUtilization {
    pub pool_name: String,
    pub cidr: String,
    /// Every address in the CIDR, network and broadcast included.
    pub total_addresses: u64,
    /// Host addresses (network and broadcast excluded).
    pub usable_addresses: u64,
    pub reserved_addresses: u64,
    pub allocated_addresses: u64,
    pub available_addresses: u64,
    /// Allocated share of usable-minus-reserved, rounded to two decimals.
    pub utilization_percent: f64,
}

/// Record counts across the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStats {
    pub total_pools: usize,
    pub active_pools: usize,
    pub total_allocations: usize,
    pub active_allocations: usize,
    pub total_leases: usize,
    pub active_leases: usize,
    pub expired_leases: usize,
}
