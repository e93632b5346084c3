//! Instance lifecycle: create from a template, start, stop, destroy.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::Hypervisor;
use crate::domain_xml::{self, Defaults, DiskRef, DomainDescriptor, DomainDump, Origin, Overrides};
use crate::error::VirtupError;
use crate::{paths, progress};
use crate::template::TemplateStore;
use crate::vm_state::InstanceState;

/// Name of the private root volume cloned for `instance`.
pub fn root_volume(instance: &str) -> String {
    format!("{instance}-root")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    pub state: InstanceState,
    pub template: Option<String>,
    pub mac: Option<String>,
    pub addresses: Vec<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The guest powered off on request.
    Graceful,
    /// The guest ignored ACPI and was force stopped.
    Forced,
}

pub struct Lifecycle<'h, H: Hypervisor> {
    hv: &'h H,
    pool: String,
    defaults: Defaults,
    state_dir: PathBuf,
    shutdown_timeout: Duration,
    poll_interval: Duration,
}

impl<'h, H: Hypervisor> Lifecycle<'h, H> {
    pub fn new(hv: &'h H, pool: &str) -> Self {
        Self {
            hv,
            pool: pool.to_string(),
            defaults: Defaults::default(),
            state_dir: paths::data_dir(),
            shutdown_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Fallbacks for resources neither the caller nor the template profile set.
    pub fn with_defaults(mut self, defaults: Defaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Where template profiles are read from.
    pub fn with_state_dir(mut self, dir: &Path) -> Self {
        self.state_dir = dir.to_path_buf();
        self
    }

    pub fn state(&self, name: &str) -> Result<InstanceState, VirtupError> {
        Ok(InstanceState::from_status(self.hv.domain_status(name)?))
    }

    /// Clone `template` into a private root volume and define the domain.
    ///
    /// Each resource comes from `overrides`, else the template profile, else
    /// the configured defaults.
    pub fn create(
        &self,
        name: &str,
        template: &str,
        overrides: &Overrides,
    ) -> Result<Instance, VirtupError> {
        domain_xml::validate_name("instance", name)?;
        let store = TemplateStore::new(self.hv, &self.pool).with_state_dir(&self.state_dir);
        let template = store.get(template)?;
        let profile = store.profile(&template.name)?;
        let resources = overrides.or(&profile.overrides()).resolve(&self.defaults)?;

        let volume = root_volume(name);
        if self.hv.domain_status(name)?.is_some()
            || self.hv.lookup_volume(&self.pool, &volume)?.is_some()
        {
            return Err(VirtupError::InstanceExists {
                name: name.to_string(),
            });
        }

        let disk = store.clone_for_instance(&template, &volume)?;
        let built = domain_xml::build(
            name,
            resources,
            DiskRef {
                path: disk.path,
                format: disk.format,
            },
            Origin {
                template: template.name.clone(),
                pool: self.pool.clone(),
            },
        );
        let result = built.and_then(|descriptor| {
            self.define(&descriptor)?;
            Ok(descriptor)
        });

        let descriptor = match result {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(name, volume = %volume, "definition failed, removing cloned volume");
                if let Err(cleanup) = self.hv.delete_volume(&self.pool, &volume) {
                    tracing::warn!(volume = %volume, "could not remove cloned volume: {cleanup}");
                }
                return Err(e);
            }
        };

        tracing::info!(name, template = %template.name, "instance defined");
        Ok(Instance {
            name: name.to_string(),
            state: InstanceState::Defined,
            template: Some(template.name),
            mac: Some(descriptor.resources.mac),
            addresses: Vec::new(),
        })
    }

    /// Write the descriptor file, hand it to libvirt, then drop the file.
    fn define(&self, descriptor: &DomainDescriptor) -> Result<(), VirtupError> {
        let path = domain_xml::write_descriptor(descriptor)?;
        let xml = std::fs::read_to_string(&path).map_err(|e| VirtupError::Io {
            context: format!("reading descriptor {}", path.display()),
            source: e,
        });
        let result = xml.and_then(|xml| self.hv.define_domain(&descriptor.name, &xml));
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::debug!(path = %path.display(), "could not remove descriptor: {e}");
        }
        result
    }

    /// Start a defined or stopped instance.
    ///
    /// Starting a running instance succeeds with [`StartOutcome::AlreadyRunning`]
    /// unless `strict` is set, in which case it is an error.
    pub fn start(&self, name: &str, strict: bool) -> Result<StartOutcome, VirtupError> {
        let state = self.state(name)?;
        match state {
            InstanceState::Undefined | InstanceState::Destroyed => {
                Err(VirtupError::InstanceNotFound {
                    name: name.to_string(),
                })
            }
            InstanceState::Running if strict => Err(VirtupError::AlreadyRunning {
                name: name.to_string(),
            }),
            InstanceState::Running => {
                tracing::warn!(name, "instance already running");
                Ok(StartOutcome::AlreadyRunning)
            }
            InstanceState::Defined | InstanceState::Stopped => {
                debug_assert!(state.can_transition(InstanceState::Running));
                self.hv.start_domain(name)?;
                tracing::info!(name, "instance started");
                Ok(StartOutcome::Started)
            }
        }
    }

    /// ACPI shutdown, falling back to a forced stop after the shutdown timeout.
    pub async fn stop(&self, name: &str) -> Result<StopOutcome, VirtupError> {
        match self.state(name)? {
            InstanceState::Running => {}
            InstanceState::Undefined | InstanceState::Destroyed => {
                return Err(VirtupError::InstanceNotFound {
                    name: name.to_string(),
                });
            }
            InstanceState::Defined | InstanceState::Stopped => {
                return Err(VirtupError::NotRunning {
                    name: name.to_string(),
                });
            }
        }

        tracing::info!(name, "sending ACPI shutdown");
        self.hv.shutdown_domain(name)?;

        let spinner = progress::spinner(format!("Waiting for '{name}' to shut down..."));
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        loop {
            if self.state(name)? != InstanceState::Running {
                spinner.finish_and_clear();
                tracing::info!(name, "instance stopped");
                return Ok(StopOutcome::Graceful);
            }
            if tokio::time::Instant::now() >= deadline {
                spinner.finish_and_clear();
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        tracing::warn!(name, "ACPI shutdown timed out, force stopping");
        self.hv.destroy_domain(name)?;
        Ok(StopOutcome::Forced)
    }

    /// Force stop if needed, undefine, and delete the root volume.
    ///
    /// The `<name>-root` volume is only deleted when the domain carries our
    /// metadata and boots from that exact volume.
    pub fn destroy(&self, name: &str) -> Result<InstanceState, VirtupError> {
        let state = self.state(name)?;
        if matches!(state, InstanceState::Undefined | InstanceState::Destroyed) {
            return Err(VirtupError::InstanceNotFound {
                name: name.to_string(),
            });
        }

        let dump = DomainDump::parse(&self.hv.domain_xml(name)?)?;
        let owned_root = self.owned_root_volume(&dump)?;

        if state == InstanceState::Running {
            tracing::info!(name, "stopping instance before destroy");
            self.hv.destroy_domain(name)?;
        }
        self.hv.undefine_domain(name)?;
        tracing::info!(name, "domain undefined");

        match owned_root {
            Some((pool, volume)) => {
                self.hv.delete_volume(&pool, &volume)?;
                tracing::info!(name, volume = %volume, "root volume deleted");
            }
            None => tracing::warn!(name, "no root volume of ours attached, volumes left in place"),
        }
        Ok(InstanceState::Destroyed)
    }

    /// Pool and name of the root volume this instance owns, if any.
    fn owned_root_volume(
        &self,
        dump: &DomainDump,
    ) -> Result<Option<(String, String)>, VirtupError> {
        let Some(origin) = &dump.origin else {
            return Ok(None);
        };
        let volume = root_volume(&dump.name);
        let Some(info) = self.hv.lookup_volume(&origin.pool, &volume)? else {
            return Ok(None);
        };
        if dump.disk_sources.contains(&info.path) {
            Ok(Some((origin.pool.clone(), volume)))
        } else {
            Ok(None)
        }
    }

    pub fn status(&self, name: &str) -> Result<Instance, VirtupError> {
        let state = self.state(name)?;
        if state == InstanceState::Undefined {
            return Err(VirtupError::InstanceNotFound {
                name: name.to_string(),
            });
        }
        let dump = DomainDump::parse(&self.hv.domain_xml(name)?)?;
        let addresses = if state == InstanceState::Running {
            self.hv.leases(name)?.into_iter().map(|l| l.addr).collect()
        } else {
            Vec::new()
        };
        Ok(Instance {
            name: name.to_string(),
            state,
            template: dump.template().map(str::to_string),
            mac: dump.mac().map(str::to_string),
            addresses,
        })
    }

    pub fn list(&self) -> Result<Vec<Instance>, VirtupError> {
        let mut instances = Vec::new();
        for name in self.hv.list_domains()? {
            match self.status(&name) {
                Ok(instance) => instances.push(instance),
                // Undefined between listing and lookup.
                Err(VirtupError::InstanceNotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryHypervisor;
    use crate::backend::VolumeSpec;
    use crate::image::DiskFormat;

    fn hv_with_template() -> MemoryHypervisor {
        let hv = MemoryHypervisor::new().with_pool("default").with_auto_leases();
        hv.create_volume(
            "default",
            &VolumeSpec {
                name: "tmpl-base".into(),
                capacity: 8,
                format: DiskFormat::Qcow2,
            },
        )
        .unwrap();
        hv.write_volume("default", "tmpl-base", b"template");
        hv
    }

    fn resources() -> Overrides {
        Overrides::default()
    }

    fn lifecycle(hv: &MemoryHypervisor) -> Lifecycle<'_, MemoryHypervisor> {
        // No profiles are ever written here.
        Lifecycle::new(hv, "default")
            .with_state_dir(Path::new("/nonexistent/virtup-state"))
            .with_shutdown_timeout(Duration::from_millis(50), Duration::from_millis(5))
    }

    fn add_volume(hv: &MemoryHypervisor, name: &str) {
        hv.create_volume(
            "default",
            &VolumeSpec {
                name: name.into(),
                capacity: 1,
                format: DiskFormat::Raw,
            },
        )
        .unwrap();
    }

    #[test]
    fn create_clones_and_defines() {
        let hv = hv_with_template();
        let lc = lifecycle(&hv);

        let instance = lc.create("vm1", "base", &resources()).unwrap();
        assert_eq!(instance.state, InstanceState::Defined);
        assert_eq!(instance.template.as_deref(), Some("base"));
        assert_eq!(lc.state("vm1").unwrap(), InstanceState::Defined);
        assert_eq!(hv.volume_data("default", "vm1-root").unwrap(), b"template");

        let xml = hv.domain_xml("vm1").unwrap();
        assert!(xml.contains("<source file='/mem/default/vm1-root'/>"));
        assert!(xml.contains("type='qcow2'"));
    }

    #[test]
    fn instance_disk_is_independent_of_template() {
        let hv = hv_with_template();
        let lc = lifecycle(&hv);
        lc.create("vm1", "base", &resources()).unwrap();

        hv.write_volume("default", "tmpl-base", b"mutated!");
        assert_eq!(hv.volume_data("default", "vm1-root").unwrap(), b"template");
    }

    #[test]
    fn create_from_missing_template_creates_nothing() {
        let hv = hv_with_template();
        let lc = lifecycle(&hv);
        let before = hv.volume_names("default");

        let err = lc.create("vm1", "ghost", &resources()).unwrap_err();
        assert!(matches!(err, VirtupError::TemplateNotFound { .. }));
        assert_eq!(lc.state("vm1").unwrap(), InstanceState::Undefined);
        assert_eq!(hv.volume_names("default"), before);
    }

    #[test]
    fn create_existing_instance_rejected() {
        let hv = hv_with_template();
        let lc = lifecycle(&hv);
        lc.create("vm1", "base", &resources()).unwrap();

        let err = lc.create("vm1", "base", &resources()).unwrap_err();
        assert!(matches!(err, VirtupError::InstanceExists { .. }));
    }

    #[test]
    fn rejected_definition_removes_clone() {
        let hv = hv_with_template();
        hv.reject_definitions(true);
        let lc = lifecycle(&hv);

        let err = lc.create("vm1", "base", &resources()).unwrap_err();
        assert!(matches!(err, VirtupError::DefinitionFailed { .. }));
        assert_eq!(hv.volume_names("default"), vec!["tmpl-base"]);
    }

    #[test]
    fn start_while_running_is_tolerated() {
        let hv = hv_with_template();
        let lc = lifecycle(&hv);
        lc.create("vm1", "base", &resources()).unwrap();

        assert_eq!(lc.start("vm1", false).unwrap(), StartOutcome::Started);
        assert_eq!(lc.start("vm1", false).unwrap(), StartOutcome::AlreadyRunning);
        assert_eq!(lc.state("vm1").unwrap(), InstanceState::Running);
    }

    #[test]
    fn strict_start_while_running_fails() {
        let hv = hv_with_template();
        let lc = lifecycle(&hv);
        lc.create("vm1", "base", &resources()).unwrap();
        lc.start("vm1", true).unwrap();

        let err = lc.start("vm1", true).unwrap_err();
        assert!(matches!(err, VirtupError::AlreadyRunning { .. }));
        assert_eq!(lc.state("vm1").unwrap(), InstanceState::Running);
    }

    #[test]
    fn start_missing_instance() {
        let hv = hv_with_template();
        let err = lifecycle(&hv).start("ghost", false).unwrap_err();
        assert!(matches!(err, VirtupError::InstanceNotFound { .. }));
    }

    #[tokio::test]
    async fn stop_graceful() {
        let hv = hv_with_template();
        let lc = lifecycle(&hv);
        lc.create("vm1", "base", &resources()).unwrap();
        lc.start("vm1", false).unwrap();

        assert_eq!(lc.stop("vm1").await.unwrap(), StopOutcome::Graceful);
        assert_eq!(lc.state("vm1").unwrap(), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn stop_forces_unresponsive_guest() {
        let hv = hv_with_template();
        hv.ignore_shutdown(true);
        let lc = lifecycle(&hv);
        lc.create("vm1", "base", &resources()).unwrap();
        lc.start("vm1", false).unwrap();

        assert_eq!(lc.stop("vm1").await.unwrap(), StopOutcome::Forced);
        assert_eq!(lc.state("vm1").unwrap(), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn stop_requires_running() {
        let hv = hv_with_template();
        let lc = lifecycle(&hv);
        lc.create("vm1", "base", &resources()).unwrap();

        let err = lc.stop("vm1").await.unwrap_err();
        assert!(matches!(err, VirtupError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn stopped_instance_restarts() {
        let hv = hv_with_template();
        let lc = lifecycle(&hv);
        lc.create("vm1", "base", &resources()).unwrap();
        lc.start("vm1", false).unwrap();
        lc.stop("vm1").await.unwrap();

        assert_eq!(lc.start("vm1", true).unwrap(), StartOutcome::Started);
    }

    #[test]
    fn destroy_running_instance() {
        let hv = hv_with_template();
        let lc = lifecycle(&hv);
        lc.create("vm1", "base", &resources()).unwrap();
        lc.start("vm1", false).unwrap();

        assert_eq!(lc.destroy("vm1").unwrap(), InstanceState::Destroyed);
        assert_eq!(lc.state("vm1").unwrap(), InstanceState::Undefined);
        assert_eq!(hv.volume_names("default"), vec!["tmpl-base"]);
    }

    #[test]
    fn destroy_missing_instance() {
        let hv = hv_with_template();
        let err = lifecycle(&hv).destroy("ghost").unwrap_err();
        assert!(matches!(err, VirtupError::InstanceNotFound { .. }));
    }

    #[test]
    fn status_reports_template_and_addresses() {
        let hv = hv_with_template();
        let lc = lifecycle(&hv);
        lc.create("vm1", "base", &resources()).unwrap();

        let defined = lc.status("vm1").unwrap();
        assert_eq!(defined.state, InstanceState::Defined);
        assert!(defined.addresses.is_empty());

        lc.start("vm1", false).unwrap();
        let running = lc.status("vm1").unwrap();
        assert_eq!(running.state, InstanceState::Running);
        assert_eq!(running.addresses.len(), 1);
        assert_eq!(running.template.as_deref(), Some("base"));
    }

    #[test]
    fn list_includes_foreign_domains() {
        let hv = hv_with_template();
        let lc = lifecycle(&hv);
        lc.create("vm1", "base", &resources()).unwrap();
        hv.define_domain("legacy", "<domain><name>legacy</name></domain>").unwrap();

        let listed = lc.list().unwrap();
        let names: Vec<&str> = listed.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["legacy", "vm1"]);
        assert_eq!(listed[0].template, None);
    }

    #[test]
    fn create_applies_configured_defaults() {
        let hv = hv_with_template();
        let lc = lifecycle(&hv).with_defaults(Defaults {
            memory_mib: 1536,
            vcpus: 3,
            ..Defaults::default()
        });
        lc.create("vm1", "base", &resources()).unwrap();

        let xml = hv.domain_xml("vm1").unwrap();
        assert!(xml.contains("<memory unit='KiB'>1572864</memory>"));
        assert!(xml.contains("<vcpu placement='static'>3</vcpu>"));
    }

    #[test]
    fn oversized_memory_creates_nothing() {
        let hv = hv_with_template();
        let lc = lifecycle(&hv);
        let overrides = Overrides {
            memory: Some("18014398509481984".into()),
            ..Overrides::default()
        };

        let err = lc.create("vm1", "base", &overrides).unwrap_err();
        assert!(matches!(err, VirtupError::Validation { .. }));
        assert_eq!(hv.volume_names("default"), vec!["tmpl-base"]);
        assert_eq!(lc.state("vm1").unwrap(), InstanceState::Undefined);
    }

    #[test]
    fn destroy_foreign_domain_keeps_its_volume() {
        let hv = hv_with_template();
        add_volume(&hv, "legacy-root");
        hv.define_domain(
            "legacy",
            "<domain><name>legacy</name><devices><disk type='file'><source file='/mem/default/legacy-root'/></disk></devices></domain>",
        )
        .unwrap();

        assert_eq!(lifecycle(&hv).destroy("legacy").unwrap(), InstanceState::Destroyed);
        assert_eq!(hv.domain_status("legacy").unwrap(), None);
        assert!(hv.volume_names("default").contains(&"legacy-root".to_string()));
    }

    #[test]
    fn destroy_keeps_root_volume_the_domain_does_not_boot() {
        let hv = hv_with_template();
        add_volume(&hv, "vm2-root");
        hv.define_domain(
            "vm2",
            "<domain><name>vm2</name><metadata><virtup:instance xmlns:virtup='urn:virtup:instance:1'><virtup:template>base</virtup:template><virtup:pool>default</virtup:pool></virtup:instance></metadata><devices><disk type='file'><source file='/elsewhere/disk.img'/></disk></devices></domain>",
        )
        .unwrap();

        lifecycle(&hv).destroy("vm2").unwrap();
        assert!(hv.volume_names("default").contains(&"vm2-root".to_string()));
    }
}
