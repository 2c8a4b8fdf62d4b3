//! The allocation engine.
//!
//! [`AllocationEngine`] owns every mutating operation on pools, allocations
//! and leases. Each operation is one unit of work against the
//! [`RecordStore`]; operations that compute a pool's free set and then
//! write to it run inside that pool's exclusive section (see
//! [`PoolLocks`]), so two concurrent callers can never select the same
//! address.
//!
//! # Audit
//!
//! Every allocate, reserve, deallocate and renew attempt appends exactly one
//! audit entry. Successful attempts write it inside their own transaction;
//! failed attempts write it in a follow-up transaction after the failed one
//! has been rolled back. Lease expiry appends an `expire` entry for each
//! allocation it deactivates.
//!
//! # Binding
//!
//! When a request names a network interface (or the config has a default
//! one) and a [`Binder`] is installed, the address is bound after the
//! allocation commits. Binding outcome is recorded on the allocation and
//! never rolls it back.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::address_space;
use crate::binder::Binder;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::{Clock, Lease, SystemClock};
use crate::lock::PoolLocks;
use crate::model::{
    Allocation, AllocationType, AuditAction, AuditEntry, BindingStatus, NewPool, Pool,
    PoolUpdate, PoolUtilization, SystemStats,
};
use crate::store::{JsonStore, RecordStore, Tables};
use crate::strategy::{MANUAL_STRATEGY, Strategy};

/// Parameters for [`AllocationEngine::allocate_next`].
#[derive(Debug, Clone, Default)]
pub struct AllocationRequest {
    pub pool_id: u64,
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    /// Falls back to [`Config::default_strategy`].
    pub strategy: Option<Strategy>,
    /// Falls back to [`Config::default_lease_duration_seconds`].
    pub lease_duration_seconds: Option<u32>,
    /// Interface to bind the address to once allocated.
    pub interface: Option<String>,
}

impl AllocationRequest {
    pub fn new(pool_id: u64) -> Self {
        Self {
            pool_id,
            ..Default::default()
        }
    }

    pub fn client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = Some(client_name.into());
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn lease_duration(mut self, seconds: u32) -> Self {
        self.lease_duration_seconds = Some(seconds);
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }
}

/// Parameters for [`AllocationEngine::reserve_specific`].
#[derive(Debug, Clone, Default)]
pub struct ReservationRequest {
    pub pool_id: u64,
    /// Unparsed; malformed input fails with [`Error::InvalidAddress`].
    pub address: String,
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub lease_duration_seconds: Option<u32>,
    pub interface: Option<String>,
}

impl ReservationRequest {
    pub fn new(pool_id: u64, address: impl Into<String>) -> Self {
        Self {
            pool_id,
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = Some(client_name.into());
        self
    }

    pub fn lease_duration(mut self, seconds: u32) -> Self {
        self.lease_duration_seconds = Some(seconds);
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }
}

/// A committed allocation together with its lease.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub allocation: Allocation,
    pub lease: Lease,
}

impl Assignment {
    pub fn address(&self) -> Ipv4Addr {
        self.allocation.address
    }
}

/// Fields shared by dynamic allocations and reservations.
struct NewAssignment<'a> {
    pool_id: u64,
    address: Ipv4Addr,
    client_id: Option<&'a str>,
    client_name: Option<&'a str>,
    allocation_type: AllocationType,
    strategy: &'a str,
    lease_duration_seconds: u32,
    max_renewals: u32,
    action: AuditAction,
}

/// Writes an allocation, its lease and the success audit entry.
fn insert_assignment(tables: &mut Tables, new: NewAssignment<'_>, now: DateTime<Utc>) -> Assignment {
    let allocation_id = tables.next_allocation_id();
    let allocation = Allocation {
        id: allocation_id,
        pool_id: new.pool_id,
        address: new.address,
        client_id: new.client_id.map(str::to_string),
        client_name: new.client_name.map(str::to_string),
        allocation_type: new.allocation_type,
        strategy: new.strategy.to_string(),
        assigned_at: now,
        last_seen: now,
        active: true,
        network_interface: None,
        binding_status: BindingStatus::Unbound,
    };

    let lease_id = tables.next_lease_id();
    let lease = Lease::new(
        lease_id,
        new.pool_id,
        allocation_id,
        now,
        new.lease_duration_seconds,
        new.max_renewals,
    );

    tables.allocations.insert(allocation_id, allocation.clone());
    tables.leases.insert(lease_id, lease.clone());
    tables.append_audit(
        AuditEntry::success(
            new.action,
            Some(new.pool_id),
            Some(new.address),
            allocation.client_id.clone(),
            now,
        )
        .with_details(json!({
            "allocation_id": allocation_id,
            "lease_id": lease_id,
            "strategy": new.strategy,
            "lease_duration": new.lease_duration_seconds,
            "client_name": new.client_name,
        })),
    );

    Assignment { allocation, lease }
}

/// Picks an address for a dynamic allocation in `pool_id`.
fn select_address(tables: &Tables, pool_id: u64, strategy: Strategy) -> Result<Ipv4Addr> {
    let pool = tables.pool(pool_id)?;
    if !pool.active {
        return Err(Error::InactivePool(pool_id));
    }

    let free = address_space::free_addresses(pool, tables.active_allocations(pool_id))?;
    let in_use = address_space::in_use_addresses(tables.active_allocations(pool_id));
    strategy.select(&free, &in_use).ok_or(Error::PoolExhausted)
}

/// Checks that `address` may be reserved in `pool_id`.
fn check_reservable(tables: &Tables, pool_id: u64, address: Ipv4Addr) -> Result<()> {
    let pool = tables.pool(pool_id)?;
    if !pool.active {
        return Err(Error::InactivePool(pool_id));
    }

    let network = pool.network()?;
    if !network.contains(&address) {
        return Err(Error::AddressOutOfRange(address));
    }

    let free = address_space::free_addresses(pool, tables.active_allocations(pool_id))?;
    if free.binary_search(&address).is_err() {
        return Err(Error::AddressUnavailable(address));
    }
    Ok(())
}

/// An address to detach from an interface after commit.
#[derive(Debug, Clone)]
struct BoundAddress {
    allocation_id: u64,
    interface: String,
    address: Ipv4Addr,
}

fn bound_address(allocation: &Allocation) -> Option<BoundAddress> {
    match (&allocation.network_interface, allocation.binding_status) {
        (Some(interface), BindingStatus::Bound) => Some(BoundAddress {
            allocation_id: allocation.id,
            interface: interface.clone(),
            address: allocation.address,
        }),
        _ => None,
    }
}

/// Marks a lease expired and deactivates its allocation.
///
/// Returns the binding to release if the allocation was bound.
fn expire_lease(tables: &mut Tables, lease_id: u64, now: DateTime<Utc>) -> Option<BoundAddress> {
    let lease = tables.leases.get_mut(&lease_id)?;
    lease.expired = true;
    let (pool_id, allocation_id) = (lease.pool_id, lease.allocation_id);

    let deactivated = match tables.allocations.get_mut(&allocation_id) {
        Some(allocation) if allocation.active => {
            allocation.active = false;
            Some(allocation.clone())
        }
        _ => None,
    };

    let allocation = deactivated?;
    tables.append_audit(
        AuditEntry::success(
            AuditAction::Expire,
            Some(pool_id),
            Some(allocation.address),
            allocation.client_id.clone(),
            now,
        )
        .with_details(json!({ "lease_id": lease_id, "allocation_id": allocation_id })),
    );
    bound_address(&allocation)
}

enum RenewOutcome {
    Renewed(DateTime<Utc>),
    Expired,
}

/// Allocation engine over a record store.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use leasepool::{AllocationEngine, AllocationRequest, Config, JsonStore, NewPool};
///
/// # async fn example() -> leasepool::Result<()> {
/// let engine = AllocationEngine::new(Arc::new(JsonStore::in_memory()), Arc::new(Config::default()));
/// let pool = engine.create_pool(NewPool::new("lan", "192.168.1.0/24")).await?;
/// let assignment = engine
///     .allocate_next(AllocationRequest::new(pool.id).client("aa:bb:cc:dd:ee:ff"))
///     .await?;
/// println!("{}", assignment.address());
/// # Ok(())
/// # }
/// ```
pub struct AllocationEngine<S: RecordStore = JsonStore> {
    store: Arc<S>,
    config: Arc<Config>,
    locks: PoolLocks,
    clock: Arc<dyn Clock>,
    binder: Option<Arc<dyn Binder>>,
}

impl AllocationEngine<JsonStore> {
    /// Opens the engine on the store file named by `config`.
    pub async fn open(config: Config) -> Result<Self> {
        let store = JsonStore::open(&config.store_file).await?;
        Ok(Self::new(Arc::new(store), Arc::new(config)))
    }
}

impl<S: RecordStore> AllocationEngine<S> {
    pub fn new(store: Arc<S>, config: Arc<Config>) -> Self {
        let locks = PoolLocks::new(config.lock_timeout());
        Self {
            store,
            config,
            locks,
            clock: Arc::new(SystemClock),
            binder: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_binder(mut self, binder: Arc<dyn Binder>) -> Self {
        self.binder = Some(binder);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Writes committed state to durable storage.
    pub async fn save(&self) -> Result<()> {
        self.store.save().await
    }

    /// Gives the store a chance to save after a committed change.
    async fn persist(&self) {
        if let Err(failure) = self.store.maybe_save().await {
            error!("Failed to save record store: {}", failure);
        }
    }

    /// Appends a failure entry outside the rolled-back unit of work.
    async fn record_failure(
        &self,
        action: AuditAction,
        pool_id: Option<u64>,
        address: Option<Ipv4Addr>,
        client_id: Option<String>,
        failure: &Error,
    ) {
        let entry = AuditEntry::failure(
            action,
            pool_id,
            address,
            client_id,
            failure.to_string(),
            self.now(),
        );
        if let Err(store_error) = self.store.transaction(|tables| {
            tables.append_audit(entry);
            Ok(())
        }) {
            error!(
                "Failed to record {} failure in audit log: {}",
                action, store_error
            );
            return;
        }
        self.persist().await;
    }

    // Pool administration

    /// Creates an active pool. Host bits in the CIDR are truncated.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCidr`] if the CIDR does not parse
    /// - [`Error::InvalidPool`] for an empty name, a network larger than a
    ///   /16, or a reserved range outside the host range
    /// - [`Error::DuplicatePoolName`] if the name is taken
    pub async fn create_pool(&self, new_pool: NewPool) -> Result<Pool> {
        let name = new_pool.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::InvalidPool("pool name must not be empty".to_string()));
        }
        let network = address_space::parse_cidr(&new_pool.cidr)?;
        address_space::validate_pool_size(&network)?;
        address_space::validate_reserved_ranges(&network, &new_pool.reserved_ranges)?;

        let now = self.now();
        let pool = self.store.transaction(|tables| {
            if tables.pool_by_name(&name).is_some() {
                return Err(Error::DuplicatePoolName(name.clone()));
            }
            let id = tables.next_pool_id();
            let pool = Pool {
                id,
                name: name.clone(),
                cidr: network.to_string(),
                description: new_pool.description.clone(),
                gateway: new_pool.gateway,
                dns_servers: new_pool.dns_servers.clone(),
                reserved_ranges: new_pool.reserved_ranges.clone(),
                created_at: now,
                updated_at: now,
                active: true,
            };
            tables.pools.insert(id, pool.clone());
            Ok(pool)
        })?;

        info!("Created pool {} ({}) as #{}", pool.name, pool.cidr, pool.id);
        self.persist().await;
        Ok(pool)
    }

    /// Changes pool metadata. The CIDR is immutable.
    pub async fn update_pool(&self, pool_id: u64, update: PoolUpdate) -> Result<Pool> {
        let _guard = self.locks.acquire(pool_id).await?;
        let now = self.now();

        let pool = self.store.transaction(|tables| {
            let network = tables.pool(pool_id)?.network()?;

            let name = match &update.name {
                Some(name) => {
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(Error::InvalidPool(
                            "pool name must not be empty".to_string(),
                        ));
                    }
                    if tables
                        .pool_by_name(name)
                        .is_some_and(|other| other.id != pool_id)
                    {
                        return Err(Error::DuplicatePoolName(name.to_string()));
                    }
                    Some(name.to_string())
                }
                None => None,
            };
            if let Some(ranges) = &update.reserved_ranges {
                address_space::validate_reserved_ranges(&network, ranges)?;
            }

            let pool = tables.pool_mut(pool_id)?;
            if let Some(name) = name {
                pool.name = name;
            }
            if let Some(description) = &update.description {
                pool.description = Some(description.clone());
            }
            if let Some(gateway) = update.gateway {
                pool.gateway = Some(gateway);
            }
            if let Some(dns_servers) = &update.dns_servers {
                pool.dns_servers = dns_servers.clone();
            }
            if let Some(ranges) = &update.reserved_ranges {
                pool.reserved_ranges = ranges.clone();
            }
            if let Some(active) = update.active {
                pool.active = active;
            }
            pool.updated_at = now;
            Ok(pool.clone())
        })?;

        info!("Updated pool {} (#{})", pool.name, pool.id);
        self.persist().await;
        Ok(pool)
    }

    /// Deletes a pool with no active allocations, along with its inactive
    /// allocations and leases. Audit entries are kept.
    pub async fn delete_pool(&self, pool_id: u64) -> Result<Pool> {
        let guard = self.locks.acquire(pool_id).await?;

        let pool = self.store.transaction(|tables| {
            tables.pool(pool_id)?;
            let active_allocations = tables.active_allocations(pool_id).count();
            if active_allocations > 0 {
                return Err(Error::PoolInUse {
                    pool_id,
                    active_allocations,
                });
            }
            let pool = tables.pools.remove(&pool_id).ok_or(Error::PoolNotFound(pool_id))?;
            tables
                .allocations
                .retain(|_, allocation| allocation.pool_id != pool_id);
            tables.leases.retain(|_, lease| lease.pool_id != pool_id);
            Ok(pool)
        })?;

        drop(guard);
        self.locks.forget(pool_id);
        info!("Deleted pool {} (#{})", pool.name, pool.id);
        self.persist().await;
        Ok(pool)
    }

    pub fn get_pool(&self, pool_id: u64) -> Result<Pool> {
        self.store.read(|tables| tables.pool(pool_id).cloned())?
    }

    pub fn list_pools(&self, active_only: bool) -> Result<Vec<Pool>> {
        self.store.read(|tables| {
            tables
                .pools
                .values()
                .filter(|pool| !active_only || pool.active)
                .cloned()
                .collect()
        })
    }

    // Allocation

    /// Allocates an address chosen by the request's strategy.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolNotFound`] / [`Error::InactivePool`] if the pool cannot allocate
    /// - [`Error::PoolExhausted`] if no address is free
    /// - [`Error::Busy`] if the pool's exclusive section could not be entered in time
    pub async fn allocate_next(&self, request: AllocationRequest) -> Result<Assignment> {
        let strategy = request.strategy.unwrap_or(self.config.default_strategy);
        let lease_duration = request
            .lease_duration_seconds
            .unwrap_or(self.config.default_lease_duration_seconds);

        let result = self
            .allocate_in_section(&request, strategy, lease_duration)
            .await;

        match result {
            Ok(mut assignment) => {
                info!(
                    "Allocated {} from pool #{} to {} ({})",
                    assignment.address(),
                    request.pool_id,
                    request.client_id.as_deref().unwrap_or("-"),
                    strategy
                );
                self.bind_assignment(&mut assignment, request.interface.as_deref())
                    .await;
                self.persist().await;
                Ok(assignment)
            }
            Err(failure) => {
                warn!(
                    "Allocation from pool #{} failed: {}",
                    request.pool_id, failure
                );
                self.record_failure(
                    AuditAction::Allocate,
                    Some(request.pool_id),
                    None,
                    request.client_id.clone(),
                    &failure,
                )
                .await;
                Err(failure)
            }
        }
    }

    async fn allocate_in_section(
        &self,
        request: &AllocationRequest,
        strategy: Strategy,
        lease_duration: u32,
    ) -> Result<Assignment> {
        let _guard = self.locks.acquire(request.pool_id).await?;
        let now = self.now();

        self.store.transaction(|tables| {
            let address = select_address(tables, request.pool_id, strategy)?;
            Ok(insert_assignment(
                tables,
                NewAssignment {
                    pool_id: request.pool_id,
                    address,
                    client_id: request.client_id.as_deref(),
                    client_name: request.client_name.as_deref(),
                    allocation_type: AllocationType::Dynamic,
                    strategy: strategy.as_str(),
                    lease_duration_seconds: lease_duration,
                    max_renewals: self.config.default_max_renewals,
                    action: AuditAction::Allocate,
                },
                now,
            ))
        })
    }

    /// Allocates a caller-chosen address as a static allocation.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if the address does not parse
    /// - [`Error::AddressOutOfRange`] if it lies outside the pool's CIDR
    /// - [`Error::AddressUnavailable`] if it is reserved, allocated, or not a host address
    pub async fn reserve_specific(&self, request: ReservationRequest) -> Result<Assignment> {
        let lease_duration = request
            .lease_duration_seconds
            .unwrap_or(self.config.default_lease_duration_seconds);
        let parsed = address_space::parse_address(&request.address);

        let result = match &parsed {
            Ok(address) => {
                self.reserve_in_section(&request, *address, lease_duration)
                    .await
            }
            Err(_) => Err(Error::InvalidAddress(request.address.clone())),
        };

        match result {
            Ok(mut assignment) => {
                info!(
                    "Reserved {} in pool #{} for {}",
                    assignment.address(),
                    request.pool_id,
                    request.client_id.as_deref().unwrap_or("-")
                );
                self.bind_assignment(&mut assignment, request.interface.as_deref())
                    .await;
                self.persist().await;
                Ok(assignment)
            }
            Err(failure) => {
                warn!(
                    "Reservation of {} in pool #{} failed: {}",
                    request.address, request.pool_id, failure
                );
                self.record_failure(
                    AuditAction::Reserve,
                    Some(request.pool_id),
                    parsed.ok(),
                    request.client_id.clone(),
                    &failure,
                )
                .await;
                Err(failure)
            }
        }
    }

    async fn reserve_in_section(
        &self,
        request: &ReservationRequest,
        address: Ipv4Addr,
        lease_duration: u32,
    ) -> Result<Assignment> {
        let _guard = self.locks.acquire(request.pool_id).await?;
        let now = self.now();

        self.store.transaction(|tables| {
            check_reservable(tables, request.pool_id, address)?;
            Ok(insert_assignment(
                tables,
                NewAssignment {
                    pool_id: request.pool_id,
                    address,
                    client_id: request.client_id.as_deref(),
                    client_name: request.client_name.as_deref(),
                    allocation_type: AllocationType::Static,
                    strategy: MANUAL_STRATEGY,
                    lease_duration_seconds: lease_duration,
                    max_renewals: self.config.default_max_renewals,
                    action: AuditAction::Reserve,
                },
                now,
            ))
        })
    }

    /// Releases an allocation and expires its lease.
    ///
    /// # Errors
    ///
    /// - [`Error::AllocationNotFound`] if no such allocation exists
    /// - [`Error::AlreadyInactive`] if it was already released or expired
    pub async fn deallocate(&self, allocation_id: u64) -> Result<Allocation> {
        let context = self.store.read(|tables| {
            tables
                .allocations
                .get(&allocation_id)
                .map(|allocation| {
                    (
                        allocation.pool_id,
                        allocation.address,
                        allocation.client_id.clone(),
                    )
                })
        })?;

        let result = match &context {
            Some((pool_id, _, _)) => self.deallocate_in_section(*pool_id, allocation_id).await,
            None => Err(Error::AllocationNotFound(allocation_id)),
        };

        match result {
            Ok(allocation) => {
                info!(
                    "Released {} from pool #{} (allocation #{})",
                    allocation.address, allocation.pool_id, allocation.id
                );
                if let Some(bound) = bound_address(&allocation) {
                    self.release_binding(bound).await;
                }
                self.persist().await;
                Ok(allocation)
            }
            Err(failure) => {
                warn!("Release of allocation #{} failed: {}", allocation_id, failure);
                let (pool_id, address, client_id) = match context {
                    Some((pool_id, address, client_id)) => (Some(pool_id), Some(address), client_id),
                    None => (None, None, None),
                };
                self.record_failure(
                    AuditAction::Deallocate,
                    pool_id,
                    address,
                    client_id,
                    &failure,
                )
                .await;
                Err(failure)
            }
        }
    }

    async fn deallocate_in_section(&self, pool_id: u64, allocation_id: u64) -> Result<Allocation> {
        let _guard = self.locks.acquire(pool_id).await?;
        let now = self.now();

        self.store.transaction(|tables| {
            let allocation = tables
                .allocations
                .get_mut(&allocation_id)
                .ok_or(Error::AllocationNotFound(allocation_id))?;
            if !allocation.active {
                return Err(Error::AlreadyInactive(allocation_id));
            }
            allocation.active = false;
            let allocation = allocation.clone();

            if let Some(lease) = tables.lease_for_allocation_mut(allocation_id) {
                lease.expired = true;
            }

            tables.append_audit(AuditEntry::success(
                AuditAction::Deallocate,
                Some(allocation.pool_id),
                Some(allocation.address),
                allocation.client_id.clone(),
                now,
            ));
            Ok(allocation)
        })
    }

    /// Extends a lease to `now + extension_seconds`.
    ///
    /// Validity is recomputed from the lease end time: renewing a lease whose
    /// end has passed commits its expiry and fails with [`Error::LeaseExpired`].
    ///
    /// # Errors
    ///
    /// - [`Error::LeaseNotFound`] if no such lease exists
    /// - [`Error::MaxRenewalsReached`] once `max_renewals` renewals have been made
    /// - [`Error::LeaseExpired`] if the lease is no longer valid
    pub async fn renew_lease(&self, lease_id: u64, extension_seconds: u32) -> Result<DateTime<Utc>> {
        let context = self.store.read(|tables| {
            tables.leases.get(&lease_id).map(|lease| {
                let allocation = tables.allocations.get(&lease.allocation_id);
                (
                    lease.pool_id,
                    allocation.map(|allocation| allocation.address),
                    allocation.and_then(|allocation| allocation.client_id.clone()),
                )
            })
        })?;

        let result = match &context {
            Some((pool_id, _, _)) => {
                self.renew_in_section(*pool_id, lease_id, extension_seconds)
                    .await
            }
            None => Err(Error::LeaseNotFound(lease_id)),
        };

        match result {
            Ok(end) => {
                info!("Renewed lease #{} until {}", lease_id, end);
                self.persist().await;
                Ok(end)
            }
            Err(failure) => {
                warn!("Renewal of lease #{} failed: {}", lease_id, failure);
                let (pool_id, address, client_id) = match context {
                    Some((pool_id, address, client_id)) => (Some(pool_id), address, client_id),
                    None => (None, None, None),
                };
                self.record_failure(AuditAction::Renew, pool_id, address, client_id, &failure)
                    .await;
                Err(failure)
            }
        }
    }

    async fn renew_in_section(
        &self,
        pool_id: u64,
        lease_id: u64,
        extension_seconds: u32,
    ) -> Result<DateTime<Utc>> {
        let _guard = self.locks.acquire(pool_id).await?;
        let now = self.now();

        let (outcome, released) = self.store.transaction(|tables| {
            let lease = tables.lease(lease_id)?;
            let allocation = tables.allocation(lease.allocation_id)?;
            if lease.expired || !allocation.active {
                return Err(Error::LeaseExpired(lease_id));
            }
            if lease.is_expired_at(now) {
                let released = expire_lease(tables, lease_id, now);
                return Ok((RenewOutcome::Expired, released));
            }
            if !lease.can_renew() {
                return Err(Error::MaxRenewalsReached {
                    lease_id,
                    max_renewals: lease.max_renewals,
                });
            }

            let allocation_id = lease.allocation_id;
            let lease = tables
                .leases
                .get_mut(&lease_id)
                .ok_or(Error::LeaseNotFound(lease_id))?;
            lease.renew(now, extension_seconds);
            let (end, renewal_count) = (lease.end, lease.renewal_count);

            let allocation = tables
                .allocations
                .get_mut(&allocation_id)
                .ok_or(Error::AllocationNotFound(allocation_id))?;
            allocation.last_seen = now;
            let (address, client_id) = (allocation.address, allocation.client_id.clone());

            tables.append_audit(
                AuditEntry::success(AuditAction::Renew, Some(pool_id), Some(address), client_id, now)
                    .with_details(json!({
                        "lease_id": lease_id,
                        "extension": extension_seconds,
                        "renewal_count": renewal_count,
                    })),
            );
            Ok((RenewOutcome::Renewed(end), None))
        })?;

        if let Some(bound) = released {
            self.release_binding(bound).await;
        }

        match outcome {
            RenewOutcome::Renewed(end) => Ok(end),
            RenewOutcome::Expired => Err(Error::LeaseExpired(lease_id)),
        }
    }

    /// Expires every lease whose end time has passed and that is not yet
    /// marked expired, deactivating its allocation.
    ///
    /// Returns the number of leases expired by this call. Pools whose
    /// section cannot be entered in time are skipped and picked up by the
    /// next sweep.
    pub async fn sweep_expired_leases(&self) -> Result<usize> {
        let now = self.now();
        let overdue: BTreeMap<u64, Vec<u64>> = self.store.read(|tables| {
            let mut overdue: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
            for lease in tables.leases.values() {
                if !lease.expired && lease.is_expired_at(now) {
                    overdue.entry(lease.pool_id).or_default().push(lease.id);
                }
            }
            overdue
        })?;

        let mut count = 0;
        for (pool_id, lease_ids) in overdue {
            let _guard = match self.locks.acquire(pool_id).await {
                Ok(guard) => guard,
                Err(failure) => {
                    warn!("Skipping expiry sweep of pool #{}: {}", pool_id, failure);
                    continue;
                }
            };

            let (expired, released) = self.store.transaction(|tables| {
                let mut expired = 0;
                let mut released = Vec::new();
                for lease_id in &lease_ids {
                    let still_overdue = tables
                        .leases
                        .get(lease_id)
                        .is_some_and(|lease| !lease.expired && lease.is_expired_at(now));
                    if !still_overdue {
                        continue;
                    }
                    released.extend(expire_lease(tables, *lease_id, now));
                    expired += 1;
                }
                Ok((expired, released))
            })?;

            debug!("Expired {} lease(s) in pool #{}", expired, pool_id);
            count += expired;
            for bound in released {
                self.release_binding(bound).await;
            }
        }

        if count > 0 {
            info!("Expired {} lease(s)", count);
            self.persist().await;
        }
        Ok(count)
    }

    // Binding

    async fn bind_assignment(&self, assignment: &mut Assignment, interface: Option<&str>) {
        let Some(interface) = interface.or(self.config.default_interface.as_deref()) else {
            return;
        };
        let Some(binder) = &self.binder else {
            warn!(
                "No binder configured; {} left unbound from {}",
                assignment.address(),
                interface
            );
            return;
        };

        let address = assignment.address();
        let mask = self
            .get_pool(assignment.allocation.pool_id)
            .and_then(|pool| pool.network())
            .map(|network| network.netmask())
            .ok();

        let status = match binder.bind(interface, address, mask).await {
            Ok(()) => {
                info!("Bound {} to {}", address, interface);
                BindingStatus::Bound
            }
            Err(failure) => {
                warn!("Binding {} to {} failed: {}", address, interface, failure);
                BindingStatus::Failed
            }
        };

        let allocation_id = assignment.allocation.id;
        let recorded = self.store.transaction(|tables| {
            if let Some(allocation) = tables.allocations.get_mut(&allocation_id) {
                allocation.network_interface = Some(interface.to_string());
                allocation.binding_status = status;
            }
            Ok(())
        });
        if let Err(failure) = recorded {
            error!(
                "Failed to record binding status of allocation #{}: {}",
                allocation_id, failure
            );
        }

        assignment.allocation.network_interface = Some(interface.to_string());
        assignment.allocation.binding_status = status;
    }

    async fn release_binding(&self, bound: BoundAddress) {
        let Some(binder) = &self.binder else {
            return;
        };

        match binder.unbind(&bound.interface, bound.address).await {
            Ok(()) => {
                info!("Unbound {} from {}", bound.address, bound.interface);
                let recorded = self.store.transaction(|tables| {
                    if let Some(allocation) = tables.allocations.get_mut(&bound.allocation_id) {
                        allocation.binding_status = BindingStatus::Unbound;
                    }
                    Ok(())
                });
                if let Err(failure) = recorded {
                    error!(
                        "Failed to record unbinding of allocation #{}: {}",
                        bound.allocation_id, failure
                    );
                }
            }
            Err(failure) => {
                warn!(
                    "Unbinding {} from {} failed: {}",
                    bound.address, bound.interface, failure
                );
            }
        }
    }

    // Queries

    pub fn free_addresses(&self, pool_id: u64) -> Result<Vec<Ipv4Addr>> {
        self.store.read(|tables| {
            let pool = tables.pool(pool_id)?;
            address_space::free_addresses(pool, tables.active_allocations(pool_id))
        })?
    }

    pub fn utilization(&self, pool_id: u64) -> Result<PoolUtilization> {
        self.store.read(|tables| {
            let pool = tables.pool(pool_id)?;
            address_space::utilization(pool, tables.active_allocations(pool_id))
        })?
    }

    pub fn get_allocation(&self, allocation_id: u64) -> Result<Allocation> {
        self.store
            .read(|tables| tables.allocation(allocation_id).cloned())?
    }

    pub fn list_allocations(&self, pool_id: Option<u64>, active_only: bool) -> Result<Vec<Allocation>> {
        self.store.read(|tables| {
            tables
                .allocations
                .values()
                .filter(|allocation| pool_id.is_none_or(|id| allocation.pool_id == id))
                .filter(|allocation| !active_only || allocation.active)
                .cloned()
                .collect()
        })
    }

    pub fn get_lease(&self, lease_id: u64) -> Result<Lease> {
        self.store.read(|tables| tables.lease(lease_id).cloned())?
    }

    pub fn lease_for_allocation(&self, allocation_id: u64) -> Result<Lease> {
        self.store.read(|tables| {
            tables.allocation(allocation_id)?;
            tables
                .lease_for_allocation(allocation_id)
                .cloned()
                .ok_or(Error::AllocationNotFound(allocation_id))
        })?
    }

    /// Leases, optionally restricted to one pool and to those still valid now.
    pub fn list_leases(&self, pool_id: Option<u64>, active_only: bool) -> Result<Vec<Lease>> {
        let now = self.now();
        self.store.read(|tables| {
            tables
                .leases
                .values()
                .filter(|lease| pool_id.is_none_or(|id| lease.pool_id == id))
                .filter(|lease| !active_only || lease.is_valid_at(now))
                .cloned()
                .collect()
        })
    }

    /// Time left on a lease; zero once it has ended.
    pub fn lease_remaining(&self, lease_id: u64) -> Result<TimeDelta> {
        let now = self.now();
        self.get_lease(lease_id)
            .map(|lease| lease.remaining_at(now))
    }

    pub fn audit_log(&self, pool_id: Option<u64>) -> Result<Vec<AuditEntry>> {
        self.store.read(|tables| {
            tables
                .audit_log
                .iter()
                .filter(|entry| pool_id.is_none_or(|id| entry.pool_id == Some(id)))
                .cloned()
                .collect()
        })
    }

    pub fn stats(&self) -> Result<SystemStats> {
        let now = self.now();
        self.store.read(|tables| {
            let active_leases = tables
                .leases
                .values()
                .filter(|lease| lease.is_valid_at(now))
                .count();
            SystemStats {
                total_pools: tables.pools.len(),
                active_pools: tables.pools.values().filter(|pool| pool.active).count(),
                total_allocations: tables.allocations.len(),
                active_allocations: tables
                    .allocations
                    .values()
                    .filter(|allocation| allocation.active)
                    .count(),
                total_leases: tables.leases.len(),
                active_leases,
                expired_leases: tables.leases.len() - active_leases,
            }
        })
    }
}
