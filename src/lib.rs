//! # leasepool
//!
//! An IPv4 address pool allocation engine with time-bounded leases.
//!
//! ## Features
//!
//! - Named pools over CIDR ranges with excluded (reserved) address ranges
//! - Dynamic allocation by strategy: first-fit, random, sequential, load-balanced
//! - Static reservation of a specific address
//! - Leases with bounded renewal and expiry sweeping
//! - Per-pool exclusive sections so concurrent callers never share an address
//! - Append-only audit log of every allocation attempt
//! - Optional binding of allocated addresses to OS network interfaces
//! - JSON persistence of all records
//!
//! ## Quick Start
//!
//! ```no_run
//! use leasepool::{AllocationEngine, AllocationRequest, Config, NewPool};
//!
//! #[tokio::main]
//! async fn main() -> leasepool::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let engine = AllocationEngine::open(config).await?;
//!     let pool = engine.create_pool(NewPool::new("lan", "192.168.1.0/24")).await?;
//!     let assignment = engine.allocate_next(AllocationRequest::new(pool.id)).await?;
//!     println!("allocated {}", assignment.address());
//!     engine.save().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`AllocationEngine`] - Allocation, reservation, release, renewal and expiry
//! - [`RecordStore`] - Transactional storage; [`JsonStore`] is the file-backed default
//! - [`Strategy`] - Address selection policies
//! - [`Lease`] - Lease time arithmetic and the [`Clock`] the engine reads
//! - [`Binder`] - Interface binding; [`ShellBinder`] drives `ip`/`netsh`

pub mod address_space;
pub mod binder;
pub mod config;
pub mod engine;
pub mod error;
pub mod lease;
pub mod lock;
pub mod model;
pub mod store;
pub mod strategy;

pub use binder::{Binder, ShellBinder};
pub use config::Config;
pub use engine::{AllocationEngine, AllocationRequest, Assignment, ReservationRequest};
pub use error::{Error, Result};
pub use lease::{Clock, Lease, ManualClock, SystemClock};
pub use model::{
    Allocation, AllocationType, AuditAction, AuditEntry, BindingStatus, NewPool, Pool,
    PoolUpdate, PoolUtilization, ReservedRange, SystemStats,
};
pub use store::{JsonStore, RecordStore, Tables};
pub use strategy::Strategy;
