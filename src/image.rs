//! Local disk image inspection.
//!
//! Before a template volume can be created we need two facts about the
//! source image: the on-disk format libvirt should record for the volume,
//! and how large the volume has to be. Raw images are as large as the file.
//! QCOW2 images carry their virtual size in the header:
//!
//! ```text
//!   offset  0: magic        u32 BE  "QFI\xfb"
//!   offset  4: version      u32 BE  (2 or 3)
//!   offset 24: virtual size u64 BE  (bytes)
//! ```
//!
//! Reference: <https://github.com/qemu/qemu/blob/master/docs/interop/qcow2.txt>

use std::fmt;
use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;

use crate::error::VirtupError;

const QCOW2_MAGIC: u32 = 0x514649FB;
const QCOW2_HEADER_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Raw,
    Qcow2,
}

impl DiskFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
        }
    }

    /// Map a libvirt volume format name; unknown formats are treated as raw.
    pub fn from_libvirt(s: &str) -> Self {
        match s {
            "qcow2" => DiskFormat::Qcow2,
            _ => DiskFormat::Raw,
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What we know about an image on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub path: PathBuf,
    pub format: DiskFormat,
    /// Bytes that will be streamed into the volume.
    pub file_size: u64,
    /// Guest-visible disk size.
    pub virtual_size: u64,
}

impl ImageInfo {
    /// Capacity to request for the backing volume. Never smaller than the
    /// upload itself, or libvirt refuses the stream.
    pub fn volume_capacity(&self) -> u64 {
        self.virtual_size.max(self.file_size)
    }
}

/// Inspect `path`, detecting QCOW2 by header magic and falling back to raw.
pub async fn probe(path: &Path) -> Result<ImageInfo, VirtupError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(VirtupError::ImageNotFound {
                path: path.display().to_string(),
            });
        }
        Err(e) => {
            return Err(VirtupError::Io {
                context: format!("reading metadata for {}", path.display()),
                source: e,
            });
        }
    };
    if !meta.is_file() {
        return Err(VirtupError::Validation {
            message: format!("image '{}' is not a regular file", path.display()),
        });
    }
    let file_size = meta.len();

    let mut header = Vec::with_capacity(QCOW2_HEADER_LEN);
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| VirtupError::Io {
            context: format!("opening image {}", path.display()),
            source: e,
        })?;
    file.take(QCOW2_HEADER_LEN as u64)
        .read_to_end(&mut header)
        .await
        .map_err(|e| VirtupError::Io {
            context: format!("reading header of {}", path.display()),
            source: e,
        })?;

    let (format, virtual_size) = match qcow2_virtual_size(&header) {
        Some(size) => (DiskFormat::Qcow2, size),
        None => (DiskFormat::Raw, file_size),
    };

    tracing::debug!(
        path = %path.display(),
        %format,
        file_size,
        virtual_size,
        "probed image"
    );

    Ok(ImageInfo {
        path: path.to_path_buf(),
        format,
        file_size,
        virtual_size,
    })
}

/// Virtual size from a QCOW2 header, or `None` if the bytes are not one.
fn qcow2_virtual_size(header: &[u8]) -> Option<u64> {
    if header.len() < QCOW2_HEADER_LEN {
        return None;
    }
    let magic = u32::from_be_bytes(header[0..4].try_into().ok()?);
    if magic != QCOW2_MAGIC {
        return None;
    }
    let version = u32::from_be_bytes(header[4..8].try_into().ok()?);
    if !(2..=3).contains(&version) {
        return None;
    }
    Some(u64::from_be_bytes(header[24..32].try_into().ok()?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal QCOW2 header: enough for [`probe`] to recognise it.
    pub(crate) fn qcow2_header(virtual_size: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        buf[0..4].copy_from_slice(&QCOW2_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&3u32.to_be_bytes());
        buf[20..24].copy_from_slice(&16u32.to_be_bytes());
        buf[24..32].copy_from_slice(&virtual_size.to_be_bytes());
        buf
    }

    #[test]
    fn header_detection() {
        assert_eq!(qcow2_virtual_size(&qcow2_header(8 << 30)), Some(8 << 30));
        assert_eq!(qcow2_virtual_size(b"QFI"), None);
        assert_eq!(qcow2_virtual_size(&[0u8; 64]), None);
    }

    #[test]
    fn unsupported_qcow_version_is_raw() {
        let mut header = qcow2_header(1024);
        header[4..8].copy_from_slice(&1u32.to_be_bytes());
        assert_eq!(qcow2_virtual_size(&header), None);
    }

    #[tokio::test]
    async fn probe_qcow2_uses_virtual_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.qcow2");
        std::fs::write(&path, qcow2_header(20 << 30)).unwrap();

        let info = probe(&path).await.unwrap();
        assert_eq!(info.format, DiskFormat::Qcow2);
        assert_eq!(info.virtual_size, 20 << 30);
        assert_eq!(info.file_size, 512);
        assert_eq!(info.volume_capacity(), 20 << 30);
    }

    #[tokio::test]
    async fn probe_raw_uses_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0xAAu8; 4096]).unwrap();

        let info = probe(&path).await.unwrap();
        assert_eq!(info.format, DiskFormat::Raw);
        assert_eq!(info.virtual_size, 4096);
        assert_eq!(info.volume_capacity(), 4096);
    }

    #[tokio::test]
    async fn probe_missing_image() {
        let err = probe(Path::new("/nonexistent/ubuntu.img")).await.unwrap_err();
        assert!(matches!(err, VirtupError::ImageNotFound { .. }));
    }
}
