use virt::connect::Connect;
use virt::domain::Domain;
use virt::error as virt_error;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::stream::Stream;
use virt::sys;

use super::{DomainStatus, Hypervisor, Lease, UploadSink, VolumeInfo, VolumeSpec};
use crate::error::VirtupError;
use crate::volume_xml;

/// One libvirt connection, scoped to a single command. Closed on drop.
pub struct LibvirtSession {
    conn: Connect,
    uri: String,
}

impl LibvirtSession {
    pub fn open(uri: &str) -> Result<Self, VirtupError> {
        // Suppress libvirt's default error handler that prints to stderr;
        // errors surface through the Result types only.
        virt_error::clear_error_callback();

        let conn = Connect::open(Some(uri)).map_err(|e| VirtupError::Libvirt {
            message: format!("failed to connect to libvirt: {e}"),
            hint: format!("ensure libvirtd is running and you have access to {uri}"),
        })?;
        tracing::debug!(uri, "connected to libvirt");
        Ok(Self {
            conn,
            uri: uri.to_string(),
        })
    }

    fn pool(&self, name: &str) -> Result<StoragePool, VirtupError> {
        StoragePool::lookup_by_name(&self.conn, name).map_err(|_| VirtupError::PoolNotFound {
            pool: name.to_string(),
        })
    }

    fn domain(&self, name: &str) -> Result<Domain, VirtupError> {
        Domain::lookup_by_name(&self.conn, name).map_err(|_| VirtupError::InstanceNotFound {
            name: name.to_string(),
        })
    }
}

impl Drop for LibvirtSession {
    fn drop(&mut self) {
        if let Err(e) = self.conn.close() {
            tracing::debug!("closing libvirt connection failed: {e}");
        }
    }
}

fn libvirt_err(action: String, hint: &'static str) -> impl FnOnce(virt_error::Error) -> VirtupError {
    move |e| VirtupError::Libvirt {
        message: format!("{action}: {e}"),
        hint: hint.into(),
    }
}

fn volume_info(vol: &StorageVol) -> Result<VolumeInfo, VirtupError> {
    let name = vol
        .get_name()
        .map_err(libvirt_err("reading volume name".into(), "check libvirt permissions"))?;
    let path = vol
        .get_path()
        .map_err(libvirt_err(format!("reading path of {name}"), "check libvirt permissions"))?;
    let info = vol
        .get_info()
        .map_err(libvirt_err(format!("reading info of {name}"), "check libvirt permissions"))?;
    let xml = vol
        .get_xml_desc(0)
        .map_err(libvirt_err(format!("reading XML of {name}"), "check libvirt permissions"))?;
    Ok(VolumeInfo {
        name,
        path,
        capacity: info.capacity,
        allocation: info.allocation,
        format: volume_xml::format_of(&xml)?,
    })
}

impl Hypervisor for LibvirtSession {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn ensure_pool(&self, pool: &str) -> Result<(), VirtupError> {
        let p = self.pool(pool)?;
        if !p.is_active().unwrap_or(false) {
            tracing::info!(pool, "starting inactive storage pool");
            p.create(0).map_err(libvirt_err(
                format!("failed to start storage pool '{pool}'"),
                "try `sudo virsh pool-start <pool>`",
            ))?;
        }
        p.refresh(0).map_err(libvirt_err(
            format!("failed to refresh storage pool '{pool}'"),
            "check the pool's target directory",
        ))?;
        Ok(())
    }

    fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>, VirtupError> {
        let p = self.pool(pool)?;
        let names = p.list_volumes().map_err(libvirt_err(
            format!("failed to list volumes in '{pool}'"),
            "check libvirt permissions",
        ))?;
        let mut volumes = Vec::with_capacity(names.len());
        for name in names {
            // Volumes can vanish between listing and lookup.
            if let Ok(vol) = StorageVol::lookup_by_name(&p, &name) {
                volumes.push(volume_info(&vol)?);
            }
        }
        Ok(volumes)
    }

    fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeInfo>, VirtupError> {
        let p = self.pool(pool)?;
        match StorageVol::lookup_by_name(&p, name) {
            Ok(vol) => volume_info(&vol).map(Some),
            Err(_) => Ok(None),
        }
    }

    fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeInfo, VirtupError> {
        let p = self.pool(pool)?;
        let xml = volume_xml::generate_volume_xml(&spec.name, spec.capacity, spec.format)?;
        let vol = StorageVol::create_xml(&p, &xml, 0).map_err(libvirt_err(
            format!("failed to create volume '{}'", spec.name),
            "check free space in the storage pool",
        ))?;
        tracing::debug!(pool, volume = %spec.name, capacity = spec.capacity, "volume created");
        volume_info(&vol)
    }

    fn upload<'a>(
        &'a self,
        pool: &str,
        volume: &str,
        length: u64,
    ) -> Result<Box<dyn UploadSink + 'a>, VirtupError> {
        let p = self.pool(pool)?;
        let vol = StorageVol::lookup_by_name(&p, volume).map_err(libvirt_err(
            format!("volume '{volume}' vanished before upload"),
            "check the storage pool",
        ))?;
        let stream = Stream::new(&self.conn, 0).map_err(libvirt_err(
            "failed to open upload stream".into(),
            "check libvirt permissions",
        ))?;
        vol.upload(&stream, 0, length, 0)
            .map_err(|e| VirtupError::TransferFailed {
                target: volume.to_string(),
                message: e.to_string(),
            })?;
        Ok(Box::new(LibvirtUpload {
            stream: Some(stream),
            target: volume.to_string(),
        }))
    }

    fn clone_volume(
        &self,
        pool: &str,
        source: &str,
        spec: &VolumeSpec,
    ) -> Result<VolumeInfo, VirtupError> {
        let p = self.pool(pool)?;
        let src = StorageVol::lookup_by_name(&p, source).map_err(libvirt_err(
            format!("source volume '{source}' not found"),
            "check the storage pool",
        ))?;
        let xml = volume_xml::generate_volume_xml(&spec.name, spec.capacity, spec.format)?;
        let vol = StorageVol::create_xml_from(&p, &xml, &src, 0).map_err(libvirt_err(
            format!("failed to clone '{source}' into '{}'", spec.name),
            "check free space in the storage pool",
        ))?;
        tracing::debug!(pool, source, volume = %spec.name, "volume cloned");
        volume_info(&vol)
    }

    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), VirtupError> {
        let p = self.pool(pool)?;
        let vol = StorageVol::lookup_by_name(&p, name).map_err(libvirt_err(
            format!("volume '{name}' not found in '{pool}'"),
            "check the storage pool",
        ))?;
        vol.delete(0).map_err(libvirt_err(
            format!("failed to delete volume '{name}'"),
            "check libvirt permissions",
        ))?;
        tracing::debug!(pool, volume = name, "volume deleted");
        Ok(())
    }

    fn list_domains(&self) -> Result<Vec<String>, VirtupError> {
        let domains = self.conn.list_all_domains(0).map_err(libvirt_err(
            "failed to list domains".into(),
            "check libvirt permissions",
        ))?;
        let mut names = Vec::with_capacity(domains.len());
        for dom in &domains {
            names.push(dom.get_name().map_err(libvirt_err(
                "reading domain name".into(),
                "check libvirt permissions",
            ))?);
        }
        names.sort();
        Ok(names)
    }

    fn domain_status(&self, name: &str) -> Result<Option<DomainStatus>, VirtupError> {
        let Ok(dom) = Domain::lookup_by_name(&self.conn, name) else {
            return Ok(None);
        };
        let (state, reason) = dom.get_state().map_err(libvirt_err(
            format!("failed to read state of '{name}'"),
            "check libvirt permissions",
        ))?;
        let status = match state {
            sys::VIR_DOMAIN_SHUTOFF if reason == sys::VIR_DOMAIN_SHUTOFF_UNKNOWN as i32 => {
                DomainStatus::Defined
            }
            sys::VIR_DOMAIN_SHUTOFF | sys::VIR_DOMAIN_CRASHED => DomainStatus::Stopped,
            sys::VIR_DOMAIN_NOSTATE => {
                return Err(VirtupError::UnexpectedResponse {
                    message: format!("domain '{name}' reports no state"),
                });
            }
            _ => DomainStatus::Running,
        };
        Ok(Some(status))
    }

    fn domain_xml(&self, name: &str) -> Result<String, VirtupError> {
        self.domain(name)?.get_xml_desc(0).map_err(libvirt_err(
            format!("failed to read XML of '{name}'"),
            "check libvirt permissions",
        ))
    }

    fn define_domain(&self, name: &str, xml: &str) -> Result<(), VirtupError> {
        Domain::define_xml(&self.conn, xml).map_err(|e| VirtupError::DefinitionFailed {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        tracing::debug!(name, "domain defined");
        Ok(())
    }

    fn start_domain(&self, name: &str) -> Result<(), VirtupError> {
        self.domain(name)?.create().map_err(libvirt_err(
            format!("failed to start '{name}'"),
            "check `virsh start <name>` for details",
        ))?;
        Ok(())
    }

    fn shutdown_domain(&self, name: &str) -> Result<(), VirtupError> {
        self.domain(name)?.shutdown().map_err(libvirt_err(
            format!("shutdown of '{name}' failed"),
            "VM may not have ACPI support",
        ))?;
        Ok(())
    }

    fn destroy_domain(&self, name: &str) -> Result<(), VirtupError> {
        self.domain(name)?.destroy().map_err(libvirt_err(
            format!("force stop of '{name}' failed"),
            "check libvirt permissions",
        ))
    }

    fn undefine_domain(&self, name: &str) -> Result<(), VirtupError> {
        self.domain(name)?.undefine().map_err(libvirt_err(
            format!("failed to undefine '{name}'"),
            "check libvirt permissions",
        ))
    }

    fn leases(&self, name: &str) -> Result<Vec<Lease>, VirtupError> {
        let dom = self.domain(name)?;
        let ifaces = dom
            .interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
            .map_err(libvirt_err(
                format!("failed to query leases for '{name}'"),
                "is the instance attached to a libvirt-managed network?",
            ))?;
        let mut leases = Vec::new();
        for iface in &ifaces {
            for addr in &iface.addrs {
                leases.push(Lease::parse(&iface.hwaddr, &addr.addr, addr.prefix)?);
            }
        }
        Ok(leases)
    }
}

/// A `virStream` bound to a volume upload.
struct LibvirtUpload {
    stream: Option<Stream>,
    target: String,
}

impl UploadSink for LibvirtUpload {
    fn send(&mut self, mut chunk: &[u8]) -> Result<(), VirtupError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(VirtupError::TransferFailed {
                target: self.target.clone(),
                message: "stream already closed".into(),
            });
        };
        while !chunk.is_empty() {
            let sent = stream.send(chunk).map_err(|e| VirtupError::TransferFailed {
                target: self.target.clone(),
                message: e.to_string(),
            })?;
            if sent == 0 {
                return Err(VirtupError::TransferFailed {
                    target: self.target.clone(),
                    message: "stream accepted no data".into(),
                });
            }
            chunk = &chunk[sent..];
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), VirtupError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        stream.finish().map_err(|e| VirtupError::TransferFailed {
            target: self.target.clone(),
            message: e.to_string(),
        })
    }

    fn abort(mut self: Box<Self>) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.abort();
        }
    }
}

impl Drop for LibvirtUpload {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            tracing::debug!(volume = %self.target, "aborting unfinished upload stream");
            let _ = stream.abort();
        }
    }
}
