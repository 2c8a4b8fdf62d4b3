//! Error types for the allocation engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Domain errors are ordinary values;
//! only [`Error::is_store_failure`] errors indicate that the record store
//! itself is unusable.

use std::net::Ipv4Addr;

/// Errors that can occur during pool administration and allocation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system I/O error (config or store files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or store files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid engine configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No pool exists with this id.
    #[error("Pool {0} not found")]
    PoolNotFound(u64),

    /// No allocation exists with this id.
    #[error("Allocation {0} not found")]
    AllocationNotFound(u64),

    /// No lease exists with this id.
    #[error("Lease {0} not found")]
    LeaseNotFound(u64),

    /// The pool exists but has been deactivated.
    #[error("Pool {0} is inactive")]
    InactivePool(u64),

    /// Every usable address in the pool is reserved or allocated.
    #[error("No available IP addresses in pool")]
    PoolExhausted,

    /// Requested address is outside the pool's CIDR.
    #[error("Address {0} is outside the pool range")]
    AddressOutOfRange(Ipv4Addr),

    /// Requested address is inside the pool but reserved or already allocated.
    #[error("Address {0} is not available (allocated or reserved)")]
    AddressUnavailable(Ipv4Addr),

    /// The allocation was already released or expired.
    #[error("Allocation {0} is already inactive")]
    AlreadyInactive(u64),

    /// The lease has been renewed as many times as it may be.
    #[error("Lease {lease_id} reached its maximum of {max_renewals} renewals")]
    MaxRenewalsReached { lease_id: u64, max_renewals: u32 },

    /// The lease end time has passed; expired leases cannot be renewed.
    #[error("Lease {0} has expired")]
    LeaseExpired(u64),

    /// A pool CIDR could not be parsed.
    ///
    /// Stored pools are validated on creation, so hitting this during
    /// allocation means the stored configuration is corrupt.
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    /// An address string could not be parsed as IPv4.
    #[error("Invalid IPv4 address: {0}")]
    InvalidAddress(String),

    /// Pool definition violates an invariant (e.g. reserved range outside the host range).
    #[error("Invalid pool definition: {0}")]
    InvalidPool(String),

    /// Another pool already uses this name.
    #[error("Pool with name '{0}' already exists")]
    DuplicatePoolName(String),

    /// Pool cannot be deleted while it still has active allocations.
    #[error("Cannot delete pool {pool_id} with {active_allocations} active allocations")]
    PoolInUse {
        pool_id: u64,
        active_allocations: usize,
    },

    /// Timed out waiting for the pool's exclusive section.
    #[error("Pool {pool_id} is busy (waited {waited_ms}ms for exclusive access)")]
    Busy { pool_id: u64, waited_ms: u64 },

    /// The record store failed (poisoned lock, failed commit).
    #[error("Record store failure: {0}")]
    Store(String),

    /// Network interface binding command failed.
    #[error("Binding failed: {0}")]
    Binding(String),
}

impl Error {
    /// Returns true for failures of the persistence layer rather than the request.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Io(_) | Error::Json(_))
    }
}

/// A specialized Result type for allocation operations.
pub type Result<T> = std::result::Result<T, Error>;
