use std::path::{Path, PathBuf};

/// Local state directory: `~/.local/share/virtup/`
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("virtup")
}

/// Debug log written by every command that talks to libvirt.
pub fn log_path() -> PathBuf {
    data_dir().join("virtup.log")
}

/// Marker that exists while a template upload into `pool` is in progress.
pub fn upload_marker(state_dir: &Path, pool: &str, template: &str) -> PathBuf {
    state_dir
        .join("uploads")
        .join(pool)
        .join(format!("{template}.partial"))
}

/// Resource profile recorded when the template was imported.
pub fn template_profile(state_dir: &Path, pool: &str, template: &str) -> PathBuf {
    state_dir
        .join("templates")
        .join(pool)
        .join(format!("{template}.json"))
}

/// One-shot domain descriptor file in the system temp directory.
pub fn descriptor_path(name: &str, nonce: u32) -> PathBuf {
    std::env::temp_dir().join(format!("virtup-{name}-{nonce:08x}.xml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_marker_is_scoped_by_pool() {
        let root = Path::new("/state");
        assert_eq!(
            upload_marker(root, "default", "base"),
            PathBuf::from("/state/uploads/default/base.partial")
        );
        assert_ne!(
            upload_marker(root, "default", "base"),
            upload_marker(root, "fast", "base")
        );
    }

    #[test]
    fn template_profile_sits_beside_uploads() {
        let root = Path::new("/state");
        assert_eq!(
            template_profile(root, "fast", "base"),
            PathBuf::from("/state/templates/fast/base.json")
        );
    }

    #[test]
    fn descriptor_path_lives_in_temp_dir() {
        let path = descriptor_path("vm1", 0xabc);
        assert!(path.starts_with(std::env::temp_dir()));
        assert!(path.ends_with("virtup-vm1-00000abc.xml"));
    }
}
