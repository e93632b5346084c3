//! Named disk-image templates kept as volumes in a storage pool.
//!
//! A template `base` lives in volume `tmpl-base`. Importing streams a local
//! image into a fresh volume; instances get a full clone of it.
//!
//! While an upload runs, a marker file sits under the uploads directory. A
//! failed or interrupted upload deletes its volume and marker before
//! returning. If the process dies mid-upload the marker survives, and the
//! next import of the same name removes the stale volume before starting.
//!
//! Resource flags given at import are kept as a JSON profile next to the
//! markers and become the defaults for instances created from the template.

use std::path::{Path, PathBuf};

use facet::Facet;
use indicatif::ProgressBar;
use tokio::io::AsyncReadExt;

use crate::backend::{Hypervisor, VolumeInfo, VolumeSpec};
use crate::domain_xml::{self, Defaults, DomainDump, Overrides};
use crate::error::VirtupError;
use crate::image::{self, DiskFormat, ImageInfo};
use crate::paths;
use crate::progress;

pub const VOLUME_PREFIX: &str = "tmpl-";
const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub name: String,
    pub pool: String,
    pub volume: String,
    pub path: String,
    pub capacity: u64,
    pub format: DiskFormat,
}

impl Template {
    fn from_volume(pool: &str, vol: VolumeInfo) -> Option<Self> {
        let name = vol.name.strip_prefix(VOLUME_PREFIX)?.to_string();
        Some(Self {
            name,
            pool: pool.to_string(),
            volume: vol.name,
            path: vol.path,
            capacity: vol.capacity,
            format: vol.format,
        })
    }
}

/// Resources recorded for a template at import time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct TemplateProfile {
    pub memory: Option<String>,
    pub vcpus: Option<u32>,
    pub network: Option<String>,
}

impl TemplateProfile {
    /// Keep the resource fields of `overrides`. A MAC is per instance and is dropped.
    pub fn from_overrides(overrides: &Overrides) -> Self {
        Self {
            memory: overrides.memory.clone(),
            vcpus: overrides.vcpus,
            network: overrides.network.clone(),
        }
    }

    pub fn overrides(&self) -> Overrides {
        Overrides {
            memory: self.memory.clone(),
            vcpus: self.vcpus,
            network: self.network.clone(),
            mac: None,
        }
    }
}

pub fn volume_name(template: &str) -> String {
    format!("{VOLUME_PREFIX}{template}")
}

pub struct TemplateStore<'h, H: Hypervisor> {
    hv: &'h H,
    pool: String,
    state_dir: PathBuf,
}

impl<'h, H: Hypervisor> TemplateStore<'h, H> {
    pub fn new(hv: &'h H, pool: &str) -> Self {
        Self {
            hv,
            pool: pool.to_string(),
            state_dir: paths::data_dir(),
        }
    }

    /// Keep upload markers and profiles somewhere other than the user data directory.
    pub fn with_state_dir(mut self, dir: &Path) -> Self {
        self.state_dir = dir.to_path_buf();
        self
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Import `image` as template `name`, recording `profile` for its instances.
    pub async fn import(
        &self,
        name: &str,
        image: &Path,
        profile: &TemplateProfile,
    ) -> Result<Template, VirtupError> {
        domain_xml::validate_name("template", name)?;
        profile.overrides().resolve(&Defaults::default())?;
        let info = image::probe(image).await?;
        self.hv.ensure_pool(&self.pool)?;

        let volume = volume_name(name);
        let marker = paths::upload_marker(&self.state_dir, &self.pool, name);
        self.clear_stale_upload(name, &volume, &marker)?;

        if self.hv.lookup_volume(&self.pool, &volume)?.is_some() {
            return Err(VirtupError::DuplicateTemplate {
                name: name.to_string(),
                pool: self.pool.clone(),
            });
        }

        self.hv.create_volume(
            &self.pool,
            &VolumeSpec {
                name: volume.clone(),
                capacity: info.volume_capacity(),
                format: info.format,
            },
        )?;
        tracing::info!(
            pool = %self.pool,
            volume = %volume,
            format = %info.format,
            capacity = info.volume_capacity(),
            "template volume created"
        );

        if let Err(e) = write_marker(&marker) {
            self.discard(&volume, &marker);
            return Err(e);
        }

        let bar = progress::transfer_bar(info.file_size);
        let result = tokio::select! {
            r = self.transfer(&volume, &info, &bar) => r,
            _ = tokio::signal::ctrl_c() => Err(VirtupError::TransferInterrupted {
                target: volume.clone(),
            }),
        };

        if let Err(e) = result {
            bar.abandon();
            tracing::warn!(volume = %volume, "upload failed, removing partial volume");
            self.discard(&volume, &marker);
            return Err(e);
        }
        bar.finish_and_clear();

        if let Err(e) = self.save_profile(name, profile) {
            self.discard(&volume, &marker);
            self.remove_profile(name);
            return Err(e);
        }
        let _ = std::fs::remove_file(&marker);
        tracing::info!(template = name, pool = %self.pool, "template imported");
        self.get(name)
    }

    async fn transfer(
        &self,
        volume: &str,
        info: &ImageInfo,
        bar: &ProgressBar,
    ) -> Result<(), VirtupError> {
        let mut file = tokio::fs::File::open(&info.path)
            .await
            .map_err(|e| VirtupError::Io {
                context: format!("opening image {}", info.path.display()),
                source: e,
            })?;

        let mut sink = self.hv.upload(&self.pool, volume, info.file_size)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent: u64 = 0;
        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    sink.abort();
                    return Err(VirtupError::TransferFailed {
                        target: volume.to_string(),
                        message: format!("reading {}: {e}", info.path.display()),
                    });
                }
            };
            if let Err(e) = sink.send(&buf[..n]) {
                sink.abort();
                return Err(e);
            }
            sent += n as u64;
            bar.inc(n as u64);
        }

        if sent != info.file_size {
            sink.abort();
            return Err(VirtupError::TransferFailed {
                target: volume.to_string(),
                message: format!(
                    "image changed during upload ({sent} of {} bytes)",
                    info.file_size
                ),
            });
        }
        sink.finish()
    }

    /// Remove a volume left behind by an upload that never finished.
    fn clear_stale_upload(
        &self,
        name: &str,
        volume: &str,
        marker: &Path,
    ) -> Result<(), VirtupError> {
        if !marker.exists() {
            return Ok(());
        }
        if self.hv.lookup_volume(&self.pool, volume)?.is_some() {
            tracing::warn!(volume, "removing partial volume from an interrupted import");
            self.hv.delete_volume(&self.pool, volume)?;
        }
        self.remove_profile(name);
        std::fs::remove_file(marker).map_err(|e| VirtupError::Io {
            context: format!("removing upload marker {}", marker.display()),
            source: e,
        })
    }

    fn discard(&self, volume: &str, marker: &Path) {
        if let Err(e) = self.hv.delete_volume(&self.pool, volume) {
            tracing::warn!(volume, "could not remove partial volume: {e}");
        }
        let _ = std::fs::remove_file(marker);
    }

    pub fn profile_path(&self, name: &str) -> PathBuf {
        paths::template_profile(&self.state_dir, &self.pool, name)
    }

    /// Resources recorded at import. Templates imported without any have an empty profile.
    pub fn profile(&self, name: &str) -> Result<TemplateProfile, VirtupError> {
        let path = self.profile_path(name);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TemplateProfile::default());
            }
            Err(e) => {
                return Err(VirtupError::Io {
                    context: format!("reading template profile {}", path.display()),
                    source: e,
                });
            }
        };
        facet_json::from_str(&contents).map_err(|e| VirtupError::UnexpectedResponse {
            message: format!("template profile {} is unreadable: {e}", path.display()),
        })
    }

    fn save_profile(&self, name: &str, profile: &TemplateProfile) -> Result<(), VirtupError> {
        let path = self.profile_path(name);
        let json = facet_json::to_string(profile).map_err(|e| VirtupError::Validation {
            message: format!("serializing profile for '{name}': {e}"),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VirtupError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
        }
        std::fs::write(&path, json).map_err(|e| VirtupError::Io {
            context: format!("writing template profile {}", path.display()),
            source: e,
        })?;
        tracing::debug!(path = %path.display(), template = name, "template profile saved");
        Ok(())
    }

    fn remove_profile(&self, name: &str) {
        let path = self.profile_path(name);
        if let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), "could not remove template profile: {e}");
        }
    }

    pub fn list(&self) -> Result<Vec<Template>, VirtupError> {
        let mut templates: Vec<Template> = self
            .hv
            .list_volumes(&self.pool)?
            .into_iter()
            .filter_map(|vol| Template::from_volume(&self.pool, vol))
            .collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    pub fn get(&self, name: &str) -> Result<Template, VirtupError> {
        self.hv
            .lookup_volume(&self.pool, &volume_name(name))?
            .and_then(|vol| Template::from_volume(&self.pool, vol))
            .ok_or_else(|| VirtupError::TemplateNotFound {
                name: name.to_string(),
                pool: self.pool.clone(),
            })
    }

    /// Delete a template unless a defined instance was created from it.
    pub fn remove(&self, name: &str) -> Result<(), VirtupError> {
        let template = self.get(name)?;
        let users = self.users(name)?;
        if !users.is_empty() {
            return Err(VirtupError::TemplateInUse {
                name: name.to_string(),
                instances: users,
            });
        }
        self.hv.delete_volume(&self.pool, &template.volume)?;
        self.remove_profile(name);
        tracing::info!(template = name, pool = %self.pool, "template removed");
        Ok(())
    }

    /// Full copy of the template into a new volume for `instance`.
    pub fn clone_for_instance(
        &self,
        template: &Template,
        volume: &str,
    ) -> Result<VolumeInfo, VirtupError> {
        let vol = self.hv.clone_volume(
            &self.pool,
            &template.volume,
            &VolumeSpec {
                name: volume.to_string(),
                capacity: template.capacity,
                format: template.format,
            },
        )?;
        tracing::info!(template = %template.name, volume, "template cloned");
        Ok(vol)
    }

    /// Defined domains whose metadata names this template and pool.
    fn users(&self, name: &str) -> Result<Vec<String>, VirtupError> {
        let mut users = Vec::new();
        for domain in self.hv.list_domains()? {
            let xml = match self.hv.domain_xml(&domain) {
                Ok(xml) => xml,
                Err(VirtupError::InstanceNotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            let in_use = DomainDump::parse(&xml)?
                .origin
                .is_some_and(|o| o.template == name && o.pool == self.pool);
            if in_use {
                users.push(domain);
            }
        }
        Ok(users)
    }
}

fn write_marker(marker: &Path) -> Result<(), VirtupError> {
    if let Some(parent) = marker.parent() {
        std::fs::create_dir_all(parent).map_err(|e| VirtupError::Io {
            context: format!("creating directory {}", parent.display()),
            source: e,
        })?;
    }
    std::fs::write(marker, b"").map_err(|e| VirtupError::Io {
        context: format!("writing upload marker {}", marker.display()),
        source: e,
    })
}
