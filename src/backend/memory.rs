//! In-memory hypervisor.
//!
//! Mirrors the libvirt behaviours the lifecycle depends on, such as real
//! volume copies and errors on starting an active domain. Knobs on
//! [`MemoryHypervisor`] inject failures that are awkward to provoke on a
//! real host.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use super::{DomainStatus, Hypervisor, Lease, UploadSink, VolumeInfo, VolumeSpec};
use crate::domain_xml::DomainDump;
use crate::error::VirtupError;
use crate::image::DiskFormat;

#[derive(Debug)]
struct MemVolume {
    capacity: u64,
    format: DiskFormat,
    data: Vec<u8>,
}

#[derive(Debug)]
struct MemDomain {
    xml: String,
    status: DomainStatus,
}

#[derive(Debug, Default)]
struct State {
    pools: BTreeMap<String, BTreeMap<String, MemVolume>>,
    domains: BTreeMap<String, MemDomain>,
    leases: BTreeMap<String, Vec<Lease>>,
    auto_lease: bool,
    next_host: u8,
    fail_upload_after: Option<u64>,
    reject_definitions: bool,
    ignore_shutdown: bool,
}

#[derive(Debug, Default)]
pub struct MemoryHypervisor {
    state: RefCell<State>,
}

impl MemoryHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(self, pool: &str) -> Self {
        self.state
            .borrow_mut()
            .pools
            .insert(pool.to_string(), BTreeMap::new());
        self
    }

    /// Hand out a `192.168.122.x` lease whenever a domain starts.
    pub fn with_auto_leases(self) -> Self {
        self.state.borrow_mut().auto_lease = true;
        self
    }

    /// Make every upload fail once `bytes` have been accepted.
    pub fn fail_uploads_after(&self, bytes: u64) {
        self.state.borrow_mut().fail_upload_after = Some(bytes);
    }

    pub fn reject_definitions(&self, reject: bool) {
        self.state.borrow_mut().reject_definitions = reject;
    }

    /// Simulate a guest that ignores ACPI power-off.
    pub fn ignore_shutdown(&self, ignore: bool) {
        self.state.borrow_mut().ignore_shutdown = ignore;
    }

    pub fn add_lease(&self, domain: &str, lease: Lease) {
        self.state
            .borrow_mut()
            .leases
            .entry(domain.to_string())
            .or_default()
            .push(lease);
    }

    pub fn volume_names(&self, pool: &str) -> Vec<String> {
        self.state
            .borrow()
            .pools
            .get(pool)
            .map(|vols| vols.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn volume_data(&self, pool: &str, name: &str) -> Option<Vec<u8>> {
        self.state
            .borrow()
            .pools
            .get(pool)
            .and_then(|vols| vols.get(name))
            .map(|v| v.data.clone())
    }

    /// Overwrite a volume's bytes, as a guest writing to its disk would.
    pub fn write_volume(&self, pool: &str, name: &str, data: &[u8]) {
        if let Some(vol) = self
            .state
            .borrow_mut()
            .pools
            .get_mut(pool)
            .and_then(|vols| vols.get_mut(name))
        {
            vol.data = data.to_vec();
        }
    }

    fn not_running(name: &str) -> VirtupError {
        VirtupError::Libvirt {
            message: format!("Requested operation is not valid: domain '{name}' is not running"),
            hint: String::new(),
        }
    }
}

fn info(pool: &str, name: &str, vol: &MemVolume) -> VolumeInfo {
    VolumeInfo {
        name: name.to_string(),
        path: format!("/mem/{pool}/{name}"),
        capacity: vol.capacity,
        allocation: vol.data.len() as u64,
        format: vol.format,
    }
}

fn pool_missing(pool: &str) -> VirtupError {
    VirtupError::PoolNotFound {
        pool: pool.to_string(),
    }
}

impl Hypervisor for MemoryHypervisor {
    fn uri(&self) -> &str {
        "memory:///"
    }

    fn ensure_pool(&self, pool: &str) -> Result<(), VirtupError> {
        if self.state.borrow().pools.contains_key(pool) {
            Ok(())
        } else {
            Err(pool_missing(pool))
        }
    }

    fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>, VirtupError> {
        let state = self.state.borrow();
        let vols = state.pools.get(pool).ok_or_else(|| pool_missing(pool))?;
        Ok(vols.iter().map(|(name, v)| info(pool, name, v)).collect())
    }

    fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeInfo>, VirtupError> {
        let state = self.state.borrow();
        let vols = state.pools.get(pool).ok_or_else(|| pool_missing(pool))?;
        Ok(vols.get(name).map(|v| info(pool, name, v)))
    }

    fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeInfo, VirtupError> {
        let mut state = self.state.borrow_mut();
        let vols = state.pools.get_mut(pool).ok_or_else(|| pool_missing(pool))?;
        if vols.contains_key(&spec.name) {
            return Err(VirtupError::Libvirt {
                message: format!("storage volume '{}' exists already", spec.name),
                hint: String::new(),
            });
        }
        let vol = MemVolume {
            capacity: spec.capacity,
            format: spec.format,
            data: Vec::new(),
        };
        let result = info(pool, &spec.name, &vol);
        vols.insert(spec.name.clone(), vol);
        Ok(result)
    }

    fn upload<'a>(
        &'a self,
        pool: &str,
        volume: &str,
        length: u64,
    ) -> Result<Box<dyn UploadSink + 'a>, VirtupError> {
        if self.lookup_volume(pool, volume)?.is_none() {
            return Err(VirtupError::TransferFailed {
                target: volume.to_string(),
                message: "volume does not exist".into(),
            });
        }
        let fail_after = self.state.borrow().fail_upload_after;
        Ok(Box::new(MemoryUpload {
            hv: self,
            pool: pool.to_string(),
            volume: volume.to_string(),
            length,
            fail_after,
            buf: Vec::new(),
        }))
    }

    fn clone_volume(
        &self,
        pool: &str,
        source: &str,
        spec: &VolumeSpec,
    ) -> Result<VolumeInfo, VirtupError> {
        let data = self
            .volume_data(pool, source)
            .ok_or_else(|| VirtupError::Libvirt {
                message: format!("source volume '{source}' not found"),
                hint: String::new(),
            })?;
        self.create_volume(pool, spec)?;
        self.write_volume(pool, &spec.name, &data);
        self.lookup_volume(pool, &spec.name)?
            .ok_or_else(|| VirtupError::UnexpectedResponse {
                message: format!("cloned volume '{}' vanished", spec.name),
            })
    }

    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), VirtupError> {
        let mut state = self.state.borrow_mut();
        let vols = state.pools.get_mut(pool).ok_or_else(|| pool_missing(pool))?;
        vols.remove(name).map(|_| ()).ok_or_else(|| VirtupError::Libvirt {
            message: format!("volume '{name}' not found in '{pool}'"),
            hint: String::new(),
        })
    }

    fn list_domains(&self) -> Result<Vec<String>, VirtupError> {
        Ok(self.state.borrow().domains.keys().cloned().collect())
    }

    fn domain_status(&self, name: &str) -> Result<Option<DomainStatus>, VirtupError> {
        Ok(self.state.borrow().domains.get(name).map(|d| d.status))
    }

    fn domain_xml(&self, name: &str) -> Result<String, VirtupError> {
        self.state
            .borrow()
            .domains
            .get(name)
            .map(|d| d.xml.clone())
            .ok_or_else(|| VirtupError::InstanceNotFound {
                name: name.to_string(),
            })
    }

    fn define_domain(&self, name: &str, xml: &str) -> Result<(), VirtupError> {
        let mut state = self.state.borrow_mut();
        if state.reject_definitions {
            return Err(VirtupError::DefinitionFailed {
                name: name.to_string(),
                message: "XML error: rejected by test hypervisor".into(),
            });
        }
        let dump = DomainDump::parse(xml).map_err(|e| VirtupError::DefinitionFailed {
            name: name.to_string(),
            message: format!("XML error: {e}"),
        })?;
        if dump.name != name {
            return Err(VirtupError::DefinitionFailed {
                name: name.to_string(),
                message: format!("XML names the domain '{}'", dump.name),
            });
        }
        let status = state
            .domains
            .get(name)
            .map(|d| d.status)
            .unwrap_or(DomainStatus::Defined);
        state.domains.insert(
            name.to_string(),
            MemDomain {
                xml: xml.to_string(),
                status,
            },
        );
        Ok(())
    }

    fn start_domain(&self, name: &str) -> Result<(), VirtupError> {
        let mut state = self.state.borrow_mut();
        let auto_lease = state.auto_lease;
        let dom = state
            .domains
            .get_mut(name)
            .ok_or_else(|| VirtupError::InstanceNotFound {
                name: name.to_string(),
            })?;
        if dom.status == DomainStatus::Running {
            return Err(VirtupError::Libvirt {
                message: "Requested operation is not valid: domain is already running".into(),
                hint: String::new(),
            });
        }
        dom.status = DomainStatus::Running;
        let mac = DomainDump::parse(&dom.xml)?.mac().map(str::to_string);

        if auto_lease && let Some(mac) = mac {
            state.next_host = state.next_host.wrapping_add(1);
            let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 122, 100 + state.next_host % 100));
            state.leases.insert(
                name.to_string(),
                vec![Lease {
                    hwaddr: mac,
                    addr,
                    prefix: 24,
                }],
            );
        }
        Ok(())
    }

    fn shutdown_domain(&self, name: &str) -> Result<(), VirtupError> {
        let mut state = self.state.borrow_mut();
        let ignore = state.ignore_shutdown;
        let dom = state
            .domains
            .get_mut(name)
            .ok_or_else(|| VirtupError::InstanceNotFound {
                name: name.to_string(),
            })?;
        if dom.status != DomainStatus::Running {
            return Err(Self::not_running(name));
        }
        if !ignore {
            dom.status = DomainStatus::Stopped;
            state.leases.remove(name);
        }
        Ok(())
    }

    fn destroy_domain(&self, name: &str) -> Result<(), VirtupError> {
        let mut state = self.state.borrow_mut();
        let dom = state
            .domains
            .get_mut(name)
            .ok_or_else(|| VirtupError::InstanceNotFound {
                name: name.to_string(),
            })?;
        if dom.status != DomainStatus::Running {
            return Err(Self::not_running(name));
        }
        dom.status = DomainStatus::Stopped;
        state.leases.remove(name);
        Ok(())
    }

    fn undefine_domain(&self, name: &str) -> Result<(), VirtupError> {
        let mut state = self.state.borrow_mut();
        state.leases.remove(name);
        state
            .domains
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| VirtupError::InstanceNotFound {
                name: name.to_string(),
            })
    }

    fn leases(&self, name: &str) -> Result<Vec<Lease>, VirtupError> {
        let state = self.state.borrow();
        if !state.domains.contains_key(name) {
            return Err(VirtupError::InstanceNotFound {
                name: name.to_string(),
            });
        }
        Ok(state.leases.get(name).cloned().unwrap_or_default())
    }
}

struct MemoryUpload<'a> {
    hv: &'a MemoryHypervisor,
    pool: String,
    volume: String,
    length: u64,
    fail_after: Option<u64>,
    buf: Vec<u8>,
}

impl UploadSink for MemoryUpload<'_> {
    fn send(&mut self, chunk: &[u8]) -> Result<(), VirtupError> {
        if let Some(limit) = self.fail_after
            && (self.buf.len() + chunk.len()) as u64 > limit
        {
            return Err(VirtupError::TransferFailed {
                target: self.volume.clone(),
                message: "connection reset during upload".into(),
            });
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), VirtupError> {
        if self.buf.len() as u64 != self.length {
            return Err(VirtupError::TransferFailed {
                target: self.volume.clone(),
                message: format!("expected {} bytes, got {}", self.length, self.buf.len()),
            });
        }
        self.hv.write_volume(&self.pool, &self.volume, &self.buf);
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_is_independent_copy() {
        let hv = MemoryHypervisor::new().with_pool("default");
        let spec = |name: &str| VolumeSpec {
            name: name.into(),
            capacity: 4,
            format: DiskFormat::Raw,
        };
        hv.create_volume("default", &spec("src")).unwrap();
        hv.write_volume("default", "src", b"orig");
        hv.clone_volume("default", "src", &spec("dst")).unwrap();
        hv.write_volume("default", "src", b"new!");
        assert_eq!(hv.volume_data("default", "dst").unwrap(), b"orig");
    }

    #[test]
    fn starting_active_domain_is_an_error() {
        let hv = MemoryHypervisor::new();
        hv.define_domain("vm", "<domain><name>vm</name></domain>").unwrap();
        hv.start_domain("vm").unwrap();
        assert!(hv.start_domain("vm").is_err());
    }

    #[test]
    fn malformed_definition_is_rejected() {
        let hv = MemoryHypervisor::new();
        for xml in ["<domain/>", "<domain><name>other</name></domain>", "<domain><name>vm"] {
            let err = hv.define_domain("vm", xml).unwrap_err();
            assert!(matches!(err, VirtupError::DefinitionFailed { .. }), "{xml}");
        }
        assert!(hv.list_domains().unwrap().is_empty());
    }
}
