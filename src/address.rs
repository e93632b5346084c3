//! Wait for a running instance to pick up a DHCP lease.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::backend::{Hypervisor, Lease};
use crate::domain_xml::DomainDump;
use crate::error::VirtupError;
use crate::progress;

/// Poll lease information until an IPv4 address for the instance's MAC shows up.
///
/// Domains without a MAC in their XML accept any IPv4 lease.
pub async fn resolve_address(
    hv: &impl Hypervisor,
    name: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<Ipv4Addr, VirtupError> {
    if hv.domain_status(name)?.is_none() {
        return Err(VirtupError::InstanceNotFound {
            name: name.to_string(),
        });
    }
    let dump = DomainDump::parse(&hv.domain_xml(name)?)?;
    let mac = dump.mac();
    tracing::debug!(name, mac = ?mac, "waiting for lease");

    let spinner = progress::spinner(format!("Waiting for '{name}' to get an address..."));
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(addr) = pick(&hv.leases(name)?, mac) {
            spinner.finish_and_clear();
            tracing::info!(name, %addr, "address resolved");
            return Ok(addr);
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            spinner.finish_and_clear();
            return Err(VirtupError::AddressTimeout {
                name: name.to_string(),
                timeout,
            });
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

fn pick(leases: &[Lease], mac: Option<&str>) -> Option<Ipv4Addr> {
    leases
        .iter()
        .filter(|l| mac.is_none_or(|m| l.hwaddr.eq_ignore_ascii_case(m)))
        .find_map(|l| match l.addr {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
}
