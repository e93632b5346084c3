//! Domain descriptor construction and libvirt domain XML rendering.
//!
//! Building a descriptor is pure: defaults are applied, every field is
//! validated, and the result renders to XML. Writing the XML to a one-shot
//! file is the only side effect here and lives in [`write_descriptor`].

use std::fmt;
use std::path::PathBuf;

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;
use rand_core::{OsRng, RngCore};

use crate::error::VirtupError;
use crate::image::DiskFormat;
use crate::{paths, util};

/// Namespace for the `<metadata>` element recording where an instance came from.
pub const METADATA_NS: &str = "urn:virtup:instance:1";

pub const DEFAULT_MEMORY_MIB: u64 = 512;
pub const DEFAULT_VCPUS: u32 = 1;
pub const DEFAULT_NETWORK: &str = "network:default";

/// Where the instance NIC is plugged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkSpec {
    /// A libvirt-managed network (`network:default`).
    Network(String),
    /// A host bridge (`bridge:br0`).
    Bridge(String),
}

impl NetworkSpec {
    /// Parse `network:<name>`, `bridge:<iface>` or a bare network name.
    pub fn parse(s: &str) -> Result<Self, VirtupError> {
        let s = s.trim();
        let spec = match s.split_once(':') {
            Some(("network", name)) => NetworkSpec::Network(name.to_string()),
            Some(("bridge", iface)) => NetworkSpec::Bridge(iface.to_string()),
            Some((kind, _)) => {
                return Err(VirtupError::Validation {
                    message: format!("unknown network kind '{kind}' (use network: or bridge:)"),
                });
            }
            None => NetworkSpec::Network(s.to_string()),
        };
        let target = match &spec {
            NetworkSpec::Network(n) | NetworkSpec::Bridge(n) => n,
        };
        if target.is_empty() {
            return Err(VirtupError::Validation {
                message: format!("network spec '{s}' has an empty target"),
            });
        }
        validate_name("network", target)?;
        Ok(spec)
    }
}

impl fmt::Display for NetworkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkSpec::Network(n) => write!(f, "network:{n}"),
            NetworkSpec::Bridge(b) => write!(f, "bridge:{b}"),
        }
    }
}

/// Configured fallbacks for anything the caller leaves out.
#[derive(Debug, Clone)]
pub struct Defaults {
    pub memory_mib: u64,
    pub vcpus: u32,
    pub network: NetworkSpec,
    pub domain_type: String,
    pub machine: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            memory_mib: DEFAULT_MEMORY_MIB,
            vcpus: DEFAULT_VCPUS,
            network: NetworkSpec::Network("default".into()),
            domain_type: "kvm".into(),
            machine: "pc".into(),
        }
    }
}

/// Per-instance overrides as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub memory: Option<String>,
    pub vcpus: Option<u32>,
    pub network: Option<String>,
    pub mac: Option<String>,
}

/// Overrides merged with defaults and validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resources {
    pub memory_mib: u64,
    pub vcpus: u32,
    pub network: NetworkSpec,
    pub mac: String,
    pub domain_type: String,
    pub machine: String,
}

impl Overrides {
    /// Fill fields left unset here from `fallback`.
    pub fn or(&self, fallback: &Overrides) -> Overrides {
        Overrides {
            memory: self.memory.clone().or_else(|| fallback.memory.clone()),
            vcpus: self.vcpus.or(fallback.vcpus),
            network: self.network.clone().or_else(|| fallback.network.clone()),
            mac: self.mac.clone().or_else(|| fallback.mac.clone()),
        }
    }

    pub fn resolve(&self, defaults: &Defaults) -> Result<Resources, VirtupError> {
        let memory_mib = match &self.memory {
            Some(m) => util::parse_memory_mib(m)?,
            None => defaults.memory_mib,
        };
        if memory_mib == 0 {
            return Err(VirtupError::Validation {
                message: "memory must be at least 1 MiB".into(),
            });
        }
        util::check_memory_mib(memory_mib)?;

        let vcpus = self.vcpus.unwrap_or(defaults.vcpus);
        if vcpus == 0 {
            return Err(VirtupError::Validation {
                message: "vcpus must be at least 1".into(),
            });
        }

        let network = match &self.network {
            Some(n) => NetworkSpec::parse(n)?,
            None => defaults.network.clone(),
        };

        let mac = match &self.mac {
            Some(m) => normalize_mac(m)?,
            None => random_mac(),
        };

        Ok(Resources {
            memory_mib,
            vcpus,
            network,
            mac,
            domain_type: defaults.domain_type.clone(),
            machine: defaults.machine.clone(),
        })
    }
}

/// Reference to the disk the domain boots from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRef {
    pub path: String,
    pub format: DiskFormat,
}

/// Where the instance came from, recorded in the domain metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub template: String,
    pub pool: String,
}

/// Everything libvirt needs to define the domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDescriptor {
    pub name: String,
    pub resources: Resources,
    pub disk: DiskRef,
    pub origin: Origin,
}

/// Validate and assemble a descriptor.
pub fn build(
    name: &str,
    resources: Resources,
    disk: DiskRef,
    origin: Origin,
) -> Result<DomainDescriptor, VirtupError> {
    validate_name("instance", name)?;
    if resources.memory_mib == 0 || resources.vcpus == 0 {
        return Err(VirtupError::Validation {
            message: "memory and vcpus must be non-zero".into(),
        });
    }
    util::check_memory_mib(resources.memory_mib)?;
    if disk.path.is_empty() {
        return Err(VirtupError::Validation {
            message: format!("instance '{name}' has no disk path"),
        });
    }
    Ok(DomainDescriptor {
        name: name.to_string(),
        resources,
        disk,
        origin,
    })
}

impl DomainDescriptor {
    pub fn to_xml(&self) -> String {
        let name = &self.name;
        let r = &self.resources;
        let memory_kib = r.memory_mib.saturating_mul(1024);
        let vcpus = r.vcpus;
        let domain_type = &r.domain_type;
        let machine = &r.machine;
        let mac = &r.mac;
        let disk_format = self.disk.format;
        let disk_path = escape_attr(&self.disk.path);
        let template = &self.origin.template;
        let pool = &self.origin.pool;
        let interface = match &r.network {
            NetworkSpec::Network(n) => format!("<interface type='network'>\n      <source network='{n}'/>"),
            NetworkSpec::Bridge(b) => format!("<interface type='bridge'>\n      <source bridge='{b}'/>"),
        };

        format!(
            r#"<domain type='{domain_type}'>
  <name>{name}</name>
  <metadata>
    <virtup:instance xmlns:virtup='{METADATA_NS}'>
      <virtup:template>{template}</virtup:template>
      <virtup:pool>{pool}</virtup:pool>
    </virtup:instance>
  </metadata>
  <memory unit='KiB'>{memory_kib}</memory>
  <currentMemory unit='KiB'>{memory_kib}</currentMemory>
  <vcpu placement='static'>{vcpus}</vcpu>
  <os>
    <type arch='x86_64' machine='{machine}'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
    <pae/>
  </features>
  <clock offset='utc'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>restart</on_crash>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='{disk_format}' cache='none' io='native'/>
      <source file='{disk_path}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    {interface}
      <mac address='{mac}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <memballoon model='virtio'/>
  </devices>
</domain>
"#
        )
    }
}

/// Write the descriptor XML to a fresh temp file and return its path.
pub fn write_descriptor(descriptor: &DomainDescriptor) -> Result<PathBuf, VirtupError> {
    let path = paths::descriptor_path(&descriptor.name, OsRng.next_u32());
    std::fs::write(&path, descriptor.to_xml()).map_err(|e| VirtupError::Io {
        context: format!("writing descriptor {}", path.display()),
        source: e,
    })?;
    tracing::debug!(path = %path.display(), name = %descriptor.name, "descriptor written");
    Ok(path)
}

// ── reading back libvirt's view ────────────────────────────

/// The parts of a libvirt domain dump virtup acts on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DomainDump {
    pub name: String,
    /// MAC of every `<interface>`, lowercased, in document order.
    pub macs: Vec<String>,
    /// `<source file=...>` (or `dev=`) of every `<disk>`.
    pub disk_sources: Vec<String>,
    pub has_console: bool,
    /// Present only on domains virtup defined.
    pub origin: Option<Origin>,
}

impl DomainDump {
    /// Parse a domain dump. Anything that is not a well-formed, named
    /// `<domain>` is [`VirtupError::UnexpectedResponse`].
    pub fn parse(xml: &str) -> Result<Self, VirtupError> {
        let mut reader = NsReader::from_str(xml);
        let mut stack: Vec<String> = Vec::new();
        let mut dump = DomainDump::default();
        let mut tagged = false;
        let mut template = None;
        let mut pool = None;

        loop {
            let (ns, event) = reader.read_resolved_event().map_err(malformed)?;
            let (e, opens) = match event {
                Event::Start(e) => (e, true),
                Event::Empty(e) => (e, false),
                Event::End(_) => {
                    stack.pop();
                    continue;
                }
                Event::Text(t) => {
                    let text = t.unescape().map_err(malformed)?;
                    let text = text.trim().to_string();
                    let path: Vec<&str> = stack.iter().map(String::as_str).collect();
                    match path.as_slice() {
                        ["domain", "name"] => dump.name = text,
                        ["domain", "metadata", "virtup:instance", "virtup:template"] => {
                            template = Some(text)
                        }
                        ["domain", "metadata", "virtup:instance", "virtup:pool"] => {
                            pool = Some(text)
                        }
                        _ => {}
                    }
                    continue;
                }
                Event::Eof => break,
                _ => continue,
            };

            let key = element_key(&ns, e.local_name().as_ref());
            let path: Vec<&str> = stack.iter().map(String::as_str).collect();
            match (path.as_slice(), key.as_str()) {
                ([], "domain") => {}
                ([], other) => {
                    return Err(VirtupError::UnexpectedResponse {
                        message: format!("expected <domain>, found <{other}>"),
                    });
                }
                (["domain", "devices", "interface"], "mac") => {
                    if let Some(mac) = attribute(&e, b"address")? {
                        dump.macs.push(mac.to_ascii_lowercase());
                    }
                }
                (["domain", "devices", "disk"], "source") => {
                    if let Some(src) = attribute(&e, b"file")?.or(attribute(&e, b"dev")?) {
                        dump.disk_sources.push(src);
                    }
                }
                (["domain", "devices"], "serial" | "console") => dump.has_console = true,
                (["domain", "metadata"], "virtup:instance") => tagged = true,
                _ => {}
            }
            if opens {
                stack.push(key);
            }
        }

        if !stack.is_empty() {
            return Err(malformed(format!("<{}> is never closed", stack.join("/"))));
        }
        if dump.name.is_empty() {
            return Err(VirtupError::UnexpectedResponse {
                message: "domain XML has no <name>".into(),
            });
        }
        if tagged {
            match (template, pool) {
                (Some(template), Some(pool)) if !template.is_empty() && !pool.is_empty() => {
                    dump.origin = Some(Origin { template, pool });
                }
                _ => {
                    return Err(VirtupError::UnexpectedResponse {
                        message: format!(
                            "instance metadata on '{}' lacks a template or pool",
                            dump.name
                        ),
                    });
                }
            }
        }
        Ok(dump)
    }

    /// MAC of the first interface.
    pub fn mac(&self) -> Option<&str> {
        self.macs.first().map(String::as_str)
    }

    pub fn template(&self) -> Option<&str> {
        self.origin.as_ref().map(|o| o.template.as_str())
    }
}

/// Stack key for an element. Anything in [`METADATA_NS`] becomes
/// `virtup:<local>` whatever prefix the document bound it to.
fn element_key(ns: &ResolveResult<'_>, local: &[u8]) -> String {
    let local = String::from_utf8_lossy(local);
    match ns {
        ResolveResult::Unbound => local.into_owned(),
        ResolveResult::Bound(Namespace(uri)) if *uri == METADATA_NS.as_bytes() => {
            format!("virtup:{local}")
        }
        _ => format!("?:{local}"),
    }
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, VirtupError> {
    for attr in e.attributes() {
        let attr = attr.map_err(malformed)?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value().map_err(malformed)?.into_owned()));
        }
    }
    Ok(None)
}

fn malformed(e: impl fmt::Display) -> VirtupError {
    VirtupError::UnexpectedResponse {
        message: format!("malformed domain XML: {e}"),
    }
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('\'', "&apos;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// ── names and addresses ────────────────────────────────────

/// Names end up in volume names, file names and XML, so keep them tame:
/// `[a-zA-Z0-9][a-zA-Z0-9._-]*`.
pub fn validate_name(kind: &str, name: &str) -> Result<(), VirtupError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(VirtupError::Validation {
            message: format!("{kind} name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

/// Random MAC in the 00:16:3e range with the top bit of the fourth octet clear.
pub fn random_mac() -> String {
    let mut tail = [0u8; 3];
    OsRng.fill_bytes(&mut tail);
    format!(
        "00:16:3e:{:02x}:{:02x}:{:02x}",
        tail[0] & 0x7f,
        tail[1],
        tail[2]
    )
}

fn normalize_mac(mac: &str) -> Result<String, VirtupError> {
    let octets: Vec<&str> = mac.trim().split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(VirtupError::Validation {
            message: format!("invalid MAC address '{mac}'"),
        });
    }
    let first = u8::from_str_radix(octets[0], 16).unwrap_or(0);
    if first & 0x01 != 0 {
        return Err(VirtupError::Validation {
            message: format!("MAC address '{mac}' is multicast"),
        });
    }
    Ok(mac.trim().to_ascii_lowercase())
}
