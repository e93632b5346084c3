//! The capability surface virtup needs from a hypervisor.
//!
//! Everything above this module talks to a `&impl Hypervisor` handed in by
//! the command layer; nothing holds a connection of its own. Results come
//! back as the typed structs below, converted and checked at the boundary.

pub mod libvirt;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use std::net::IpAddr;

use crate::error::VirtupError;
use crate::image::DiskFormat;

/// A storage volume as reported by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub path: String,
    pub capacity: u64,
    pub allocation: u64,
    pub format: DiskFormat,
}

/// Parameters for a new volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub capacity: u64,
    pub format: DiskFormat,
}

/// Domain state as far as the lifecycle cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainStatus {
    /// Shut off and never started since it was defined.
    Defined,
    /// Active in any form (running, paused, shutting down).
    Running,
    /// Shut off after having run, or crashed.
    Stopped,
}

/// One address the hypervisor's network service has handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub hwaddr: String,
    pub addr: IpAddr,
    pub prefix: u32,
}

impl Lease {
    /// Validate a raw lease record. libvirt reports the prefix as a C uint.
    pub fn parse(hwaddr: &str, addr: &str, prefix: u64) -> Result<Self, VirtupError> {
        let addr: IpAddr = addr.parse().map_err(|_| VirtupError::UnexpectedResponse {
            message: format!("lease address '{addr}' is not an IP address"),
        })?;
        let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = u32::try_from(prefix)
            .ok()
            .filter(|p| *p <= max_prefix)
            .ok_or_else(|| VirtupError::UnexpectedResponse {
                message: format!("lease prefix /{prefix} is out of range for {addr}"),
            })?;
        Ok(Self {
            hwaddr: hwaddr.to_ascii_lowercase(),
            addr,
            prefix,
        })
    }
}

/// An in-flight upload into a volume. Dropping without `finish` aborts.
pub trait UploadSink {
    fn send(&mut self, chunk: &[u8]) -> Result<(), VirtupError>;
    fn finish(self: Box<Self>) -> Result<(), VirtupError>;
    fn abort(self: Box<Self>);
}

pub trait Hypervisor {
    /// Connection URI, for tools that need to open their own connection.
    fn uri(&self) -> &str;

    /// Make sure `pool` exists and is active.
    fn ensure_pool(&self, pool: &str) -> Result<(), VirtupError>;
    fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>, VirtupError>;
    fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeInfo>, VirtupError>;
    fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeInfo, VirtupError>;
    /// Start streaming `length` bytes into an existing volume.
    fn upload<'a>(
        &'a self,
        pool: &str,
        volume: &str,
        length: u64,
    ) -> Result<Box<dyn UploadSink + 'a>, VirtupError>;
    /// Full copy of `source` into a new volume.
    fn clone_volume(
        &self,
        pool: &str,
        source: &str,
        spec: &VolumeSpec,
    ) -> Result<VolumeInfo, VirtupError>;
    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), VirtupError>;

    fn list_domains(&self) -> Result<Vec<String>, VirtupError>;
    /// `None` when no domain of that name is defined.
    fn domain_status(&self, name: &str) -> Result<Option<DomainStatus>, VirtupError>;
    fn domain_xml(&self, name: &str) -> Result<String, VirtupError>;
    fn define_domain(&self, name: &str, xml: &str) -> Result<(), VirtupError>;
    fn start_domain(&self, name: &str) -> Result<(), VirtupError>;
    /// Ask the guest to power off (ACPI). Returns before it has.
    fn shutdown_domain(&self, name: &str) -> Result<(), VirtupError>;
    /// Pull the plug.
    fn destroy_domain(&self, name: &str) -> Result<(), VirtupError>;
    fn undefine_domain(&self, name: &str) -> Result<(), VirtupError>;
    /// Current DHCP leases for the domain's interfaces.
    fn leases(&self, name: &str) -> Result<Vec<Lease>, VirtupError>;
}
