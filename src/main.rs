use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use leasepool::{
    AllocationEngine, AllocationRequest, Config, NewPool, PoolUpdate, ReservationRequest,
    ReservedRange, Result, ShellBinder, Strategy,
};

#[derive(Parser)]
#[command(name = "leasepool")]
#[command(author, version, about = "IPv4 address pool allocation with leases", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage address pools
    Pools {
        #[command(subcommand)]
        command: PoolCommands,
    },
    /// Allocate the next address from a pool
    Allocate {
        pool_id: u64,
        #[arg(long)]
        client: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// first_fit, random, sequential or load_balanced
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long)]
        lease_seconds: Option<u32>,
        #[arg(long)]
        interface: Option<String>,
    },
    /// Reserve a specific address
    Reserve {
        pool_id: u64,
        address: String,
        #[arg(long)]
        client: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        lease_seconds: Option<u32>,
        #[arg(long)]
        interface: Option<String>,
    },
    /// Release an allocation
    Release { allocation_id: u64 },
    /// Extend a lease
    Renew {
        lease_id: u64,
        #[arg(long, default_value_t = 3600)]
        seconds: u32,
    },
    /// Expire leases whose end time has passed
    Sweep,
    /// Sweep periodically until interrupted
    Watch,
    Utilization { pool_id: u64 },
    Free {
        pool_id: u64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Allocations {
        #[arg(long)]
        pool: Option<u64>,
        #[arg(long)]
        all: bool,
    },
    Leases {
        #[arg(long)]
        pool: Option<u64>,
        #[arg(long)]
        all: bool,
    },
    Audit {
        #[arg(long)]
        pool: Option<u64>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    Stats,
    ShowConfig,
}

#[derive(Subcommand)]
enum PoolCommands {
    List {
        #[arg(long)]
        all: bool,
    },
    Create {
        name: String,
        cidr: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        gateway: Option<Ipv4Addr>,
        #[arg(long = "dns", value_delimiter = ',')]
        dns_servers: Vec<Ipv4Addr>,
        /// START-END, repeatable
        #[arg(long = "reserve", value_parser = parse_range)]
        reserved_ranges: Vec<ReservedRange>,
    },
    Update {
        pool_id: u64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        gateway: Option<Ipv4Addr>,
        #[arg(long = "dns", value_delimiter = ',')]
        dns_servers: Option<Vec<Ipv4Addr>>,
        #[arg(long = "reserve", value_parser = parse_range)]
        reserved_ranges: Option<Vec<ReservedRange>>,
        #[arg(long)]
        active: Option<bool>,
    },
    Delete { pool_id: u64 },
}

fn parse_range(value: &str) -> std::result::Result<ReservedRange, String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got '{}'", value))?;
    let start: Ipv4Addr = start
        .trim()
        .parse()
        .map_err(|_| format!("invalid start address '{}'", start))?;
    let end: Ipv4Addr = end
        .trim()
        .parse()
        .map_err(|_| format!("invalid end address '{}'", end))?;
    Ok(ReservedRange::new(start, end))
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;
    if let Commands::ShowConfig = cli.command {
        return print_json(&config);
    }

    let engine = AllocationEngine::open(config)
        .await?
        .with_binder(Arc::new(ShellBinder));

    let outcome = run(&engine, cli.command).await;
    if let Err(failure) = engine.save().await {
        error!("Failed to save record store: {}", failure);
        outcome?;
        return Err(failure);
    }
    outcome
}

async fn run(engine: &AllocationEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Pools { command } => run_pool_command(engine, command).await,
        Commands::Allocate {
            pool_id,
            client,
            name,
            strategy,
            lease_seconds,
            interface,
        } => {
            let request = AllocationRequest {
                pool_id,
                client_id: client,
                client_name: name,
                strategy: strategy.as_deref().map(Strategy::from_name),
                lease_duration_seconds: lease_seconds,
                interface,
            };
            let assignment = engine.allocate_next(request).await?;
            println!(
                "Allocated {} (allocation #{}, lease #{} until {})",
                assignment.address(),
                assignment.allocation.id,
                assignment.lease.id,
                format_time(assignment.lease.end)
            );
            Ok(())
        }
        Commands::Reserve {
            pool_id,
            address,
            client,
            name,
            lease_seconds,
            interface,
        } => {
            let request = ReservationRequest {
                pool_id,
                address,
                client_id: client,
                client_name: name,
                lease_duration_seconds: lease_seconds,
                interface,
            };
            let assignment = engine.reserve_specific(request).await?;
            println!(
                "Reserved {} (allocation #{}, lease #{} until {})",
                assignment.address(),
                assignment.allocation.id,
                assignment.lease.id,
                format_time(assignment.lease.end)
            );
            Ok(())
        }
        Commands::Release { allocation_id } => {
            let allocation = engine.deallocate(allocation_id).await?;
            println!("Released {}.", allocation.address);
            Ok(())
        }
        Commands::Renew { lease_id, seconds } => {
            let end = engine.renew_lease(lease_id, seconds).await?;
            println!("Lease #{} renewed until {}.", lease_id, format_time(end));
            Ok(())
        }
        Commands::Sweep => {
            let count = engine.sweep_expired_leases().await?;
            println!("Expired {} lease(s).", count);
            Ok(())
        }
        Commands::Watch => {
            let mut interval = tokio::time::interval(engine.config().sweep_interval());
            info!(
                "Sweeping expired leases every {}s",
                engine.config().sweep_interval_seconds
            );
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match engine.sweep_expired_leases().await {
                            Ok(_) => {}
                            Err(failure) if failure.is_store_failure() => return Err(failure),
                            Err(failure) => error!("Expiry sweep failed: {}", failure),
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received shutdown signal, stopping...");
                        return Ok(());
                    }
                }
            }
        }
        Commands::Utilization { pool_id } => print_json(&engine.utilization(pool_id)?),
        Commands::Free { pool_id, limit } => {
            let free = engine.free_addresses(pool_id)?;
            for address in free.iter().take(limit) {
                println!("{}", address);
            }
            if free.len() > limit {
                println!("... and {} more", free.len() - limit);
            }
            Ok(())
        }
        Commands::Allocations { pool, all } => {
            let allocations = engine.list_allocations(pool, !all)?;
            if allocations.is_empty() {
                println!("No allocations.");
                return Ok(());
            }

            println!(
                "{:<6} {:<6} {:<16} {:<24} {:<14} {:<8}",
                "ID", "Pool", "Address", "Client", "Strategy", "Active"
            );
            println!("{}", "-".repeat(78));
            for allocation in allocations {
                println!(
                    "{:<6} {:<6} {:<16} {:<24} {:<14} {:<8}",
                    allocation.id,
                    allocation.pool_id,
                    allocation.address,
                    allocation.client_id.as_deref().unwrap_or("-"),
                    allocation.strategy,
                    allocation.active
                );
            }
            Ok(())
        }
        Commands::Leases { pool, all } => {
            let leases = engine.list_leases(pool, !all)?;
            if leases.is_empty() {
                println!("No active leases.");
                return Ok(());
            }

            println!(
                "{:<6} {:<10} {:<24} {:<10} {:<8}",
                "ID", "Allocation", "Expires At", "Remaining", "Renewals"
            );
            println!("{}", "-".repeat(62));
            for lease in leases {
                let remaining = engine.lease_remaining(lease.id)?.num_seconds();
                let remaining_str = if remaining > 0 {
                    format!("{}s", remaining)
                } else {
                    "expired".to_string()
                };
                println!(
                    "{:<6} {:<10} {:<24} {:<10} {}/{}",
                    lease.id,
                    lease.allocation_id,
                    format_time(lease.end),
                    remaining_str,
                    lease.renewal_count,
                    lease.max_renewals
                );
            }
            Ok(())
        }
        Commands::Audit { pool, limit } => {
            let entries = engine.audit_log(pool)?;
            let skip = entries.len().saturating_sub(limit);
            for entry in entries.into_iter().skip(skip) {
                let address = entry
                    .address
                    .map(|address| address.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let outcome = match &entry.error {
                    Some(reason) => format!("failed: {}", reason),
                    None => "ok".to_string(),
                };
                println!(
                    "{} {:<10} {:<16} {}",
                    format_time(entry.timestamp),
                    entry.action,
                    address,
                    outcome
                );
            }
            Ok(())
        }
        Commands::Stats => print_json(&engine.stats()?),
        Commands::ShowConfig => print_json(engine.config()),
    }
}

async fn run_pool_command(engine: &AllocationEngine, command: PoolCommands) -> Result<()> {
    match command {
        PoolCommands::List { all } => {
            let pools = engine.list_pools(!all)?;
            if pools.is_empty() {
                println!("No pools.");
                return Ok(());
            }

            println!(
                "{:<6} {:<16} {:<20} {:<16} {:<8}",
                "ID", "Name", "CIDR", "Gateway", "Active"
            );
            println!("{}", "-".repeat(70));
            for pool in pools {
                let gateway = pool
                    .gateway
                    .map(|gateway| gateway.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<6} {:<16} {:<20} {:<16} {:<8}",
                    pool.id, pool.name, pool.cidr, gateway, pool.active
                );
            }
            Ok(())
        }
        PoolCommands::Create {
            name,
            cidr,
            description,
            gateway,
            dns_servers,
            reserved_ranges,
        } => {
            let pool = engine
                .create_pool(NewPool {
                    name,
                    cidr,
                    description,
                    gateway,
                    dns_servers,
                    reserved_ranges,
                })
                .await?;
            println!("Created pool #{} {} ({}).", pool.id, pool.name, pool.cidr);
            Ok(())
        }
        PoolCommands::Update {
            pool_id,
            name,
            description,
            gateway,
            dns_servers,
            reserved_ranges,
            active,
        } => {
            let update = PoolUpdate {
                name,
                description,
                gateway,
                dns_servers,
                reserved_ranges,
                active,
            };
            let pool = engine.update_pool(pool_id, update).await?;
            println!("Updated pool #{} {}.", pool.id, pool.name);
            Ok(())
        }
        PoolCommands::Delete { pool_id } => {
            let pool = engine.delete_pool(pool_id).await?;
            println!("Deleted pool #{} {}.", pool.id, pool.name);
            Ok(())
        }
    }
}
