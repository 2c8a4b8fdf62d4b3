//! Network interface binding.
//!
//! Binding is a side effect applied after an allocation has committed. A
//! failing binder never undoes the allocation; the engine only records
//! [`BindingStatus::Failed`](crate::BindingStatus::Failed).

use std::net::Ipv4Addr;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Attaches addresses to and detaches them from OS network interfaces.
#[async_trait::async_trait]
pub trait Binder: Send + Sync {
    async fn bind(
        &self,
        interface: &str,
        address: Ipv4Addr,
        subnet_mask: Option<Ipv4Addr>,
    ) -> Result<()>;

    async fn unbind(&self, interface: &str, address: Ipv4Addr) -> Result<()>;
}

/// Used when the caller gives no mask.
pub const DEFAULT_SUBNET_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Binds through the platform's command-line tools: `netsh` on Windows,
/// `ip addr` elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellBinder;

fn mask_to_prefix(mask: Ipv4Addr) -> u32 {
    u32::from(mask).count_ones()
}

fn bind_command(interface: &str, address: Ipv4Addr, mask: Ipv4Addr) -> (String, Vec<String>) {
    if cfg!(windows) {
        (
            "netsh".to_string(),
            vec![
                "interface".to_string(),
                "ipv4".to_string(),
                "add".to_string(),
                "address".to_string(),
                format!("name={}", interface),
                format!("address={}", address),
                format!("mask={}", mask),
                "store=active".to_string(),
            ],
        )
    } else {
        (
            "ip".to_string(),
            vec![
                "addr".to_string(),
                "add".to_string(),
                format!("{}/{}", address, mask_to_prefix(mask)),
                "dev".to_string(),
                interface.to_string(),
            ],
        )
    }
}

/// Finds `address` with its prefix length in `ip addr show` output.
fn find_assigned_cidr(output: &str, address: Ipv4Addr) -> Option<String> {
    let needle = format!("{}/", address);
    output
        .split_whitespace()
        .find(|token| token.starts_with(&needle))
        .map(str::to_string)
}

async fn run(program: &str, args: &[String]) -> Result<String> {
    debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|error| Error::Binding(format!("failed to run {}: {}", program, error)))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = stderr.trim();
        Err(Error::Binding(if message.is_empty() {
            format!("{} exited with {}", program, output.status)
        } else {
            message.to_string()
        }))
    }
}

#[async_trait::async_trait]
impl Binder for ShellBinder {
    async fn bind(
        &self,
        interface: &str,
        address: Ipv4Addr,
        subnet_mask: Option<Ipv4Addr>,
    ) -> Result<()> {
        let mask = subnet_mask.unwrap_or(DEFAULT_SUBNET_MASK);
        let (program, args) = bind_command(interface, address, mask);
        run(&program, &args).await.map(|_| ())
    }

    async fn unbind(&self, interface: &str, address: Ipv4Addr) -> Result<()> {
        if cfg!(windows) {
            let args = vec![
                "interface".to_string(),
                "ipv4".to_string(),
                "delete".to_string(),
                "address".to_string(),
                format!("name={}", interface),
                format!("address={}", address),
            ];
            return run("netsh", &args).await.map(|_| ());
        }

        let show = vec![
            "addr".to_string(),
            "show".to_string(),
            "dev".to_string(),
            interface.to_string(),
        ];
        let listing = run("ip", &show).await?;
        let cidr = find_assigned_cidr(&listing, address).ok_or_else(|| {
            Error::Binding(format!("{} not found on interface {}", address, interface))
        })?;

        let delete = vec![
            "addr".to_string(),
            "del".to_string(),
            cidr,
            "dev".to_string(),
            interface.to_string(),
        ];
        run("ip", &delete).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_to_prefix() {
        assert_eq!(mask_to_prefix(Ipv4Addr::new(255, 255, 255, 0)), 24);
        assert_eq!(mask_to_prefix(Ipv4Addr::new(255, 255, 255, 252)), 30);
        assert_eq!(mask_to_prefix(Ipv4Addr::new(0, 0, 0, 0)), 0);
    }

    #[test]
    fn test_find_assigned_cidr() {
        let output = "2: eth0: <BROADCAST,MULTICAST,UP> mtu 1500\n    \
                      inet 10.0.0.5/24 brd 10.0.0.255 scope global eth0\n    \
                      inet 10.0.0.50/24 scope global secondary eth0\n";
        assert_eq!(
            find_assigned_cidr(output, Ipv4Addr::new(10, 0, 0, 5)).as_deref(),
            Some("10.0.0.5/24")
        );
        assert_eq!(
            find_assigned_cidr(output, Ipv4Addr::new(10, 0, 0, 50)).as_deref(),
            Some("10.0.0.50/24")
        );
        assert_eq!(find_assigned_cidr(output, Ipv4Addr::new(10, 0, 0, 6)), None);
    }

    #[cfg(not(windows))]
    #[test]
    fn test_bind_command_uses_ip_addr() {
        let (program, args) =
            bind_command("eth0", Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(program, "ip");
        assert_eq!(args, vec!["addr", "add", "10.0.0.9/24", "dev", "eth0"]);
    }
}
