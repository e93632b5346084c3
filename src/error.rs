use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Coarse classification of failures, one exit code per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Config, IO, libvirt plumbing and anything else without its own class.
    Other,
    NotFound,
    Conflict,
    Transfer,
    Definition,
    /// Address resolution ran out of time. Safe to retry.
    Timeout,
    ConsoleUnavailable,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Other => 1,
            ErrorKind::NotFound => 3,
            ErrorKind::Conflict => 4,
            ErrorKind::Transfer => 5,
            ErrorKind::Definition => 6,
            ErrorKind::Timeout => 7,
            ErrorKind::ConsoleUnavailable => 8,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum VirtupError {
    #[error("failed to load config from {path}")]
    #[diagnostic(code(virtup::config))]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    #[diagnostic(code(virtup::config))]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    #[diagnostic(code(virtup::validation))]
    Validation { message: String },

    #[error("{context}")]
    #[diagnostic(code(virtup::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    #[diagnostic(code(virtup::libvirt), help("{hint}"))]
    Libvirt { message: String, hint: String },

    #[error("unexpected response from libvirt: {message}")]
    #[diagnostic(code(virtup::libvirt))]
    UnexpectedResponse { message: String },

    #[error("{command} failed: {message}")]
    #[diagnostic(code(virtup::external))]
    ExternalCommand { command: String, message: String },

    #[error("image '{path}' not found")]
    #[diagnostic(code(virtup::not_found))]
    ImageNotFound { path: String },

    #[error("storage pool '{pool}' not found")]
    #[diagnostic(
        code(virtup::not_found),
        help("list pools with `virsh pool-list --all` or pass --pool")
    )]
    PoolNotFound { pool: String },

    #[error("template '{name}' not found in pool '{pool}'")]
    #[diagnostic(code(virtup::not_found), help("list templates with `virtup templates`"))]
    TemplateNotFound { name: String, pool: String },

    #[error("template '{name}' already exists in pool '{pool}'")]
    #[diagnostic(
        code(virtup::conflict),
        help("remove it first with `virtup remove {name}`")
    )]
    DuplicateTemplate { name: String, pool: String },

    #[error("template '{name}' is still used by: {}", .instances.join(", "))]
    #[diagnostic(code(virtup::conflict), help("destroy those instances first"))]
    TemplateInUse { name: String, instances: Vec<String> },

    #[error("instance '{name}' not found")]
    #[diagnostic(code(virtup::not_found))]
    InstanceNotFound { name: String },

    #[error("instance '{name}' already exists")]
    #[diagnostic(code(virtup::conflict))]
    InstanceExists { name: String },

    #[error("instance '{name}' is already running")]
    #[diagnostic(code(virtup::conflict))]
    AlreadyRunning { name: String },

    #[error("instance '{name}' is not running")]
    #[diagnostic(code(virtup::conflict))]
    NotRunning { name: String },

    #[error("transfer into '{target}' failed: {message}")]
    #[diagnostic(code(virtup::transfer))]
    TransferFailed { target: String, message: String },

    #[error("transfer into '{target}' interrupted")]
    #[diagnostic(
        code(virtup::transfer),
        help("the partial volume was removed; run the import again")
    )]
    TransferInterrupted { target: String },

    #[error("failed to define domain '{name}': {message}")]
    #[diagnostic(code(virtup::definition), help("check the generated domain XML"))]
    DefinitionFailed { name: String, message: String },

    #[error("no address leased to '{name}' within {timeout:?}")]
    #[diagnostic(
        code(virtup::timeout),
        help("the guest may still be booting; retry with `virtup ip {name}`")
    )]
    AddressTimeout { name: String, timeout: Duration },

    #[error("instance '{name}' has no serial console")]
    #[diagnostic(code(virtup::console))]
    ConsoleUnavailable { name: String },
}

impl VirtupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VirtupError::ImageNotFound { .. }
            | VirtupError::PoolNotFound { .. }
            | VirtupError::TemplateNotFound { .. }
            | VirtupError::InstanceNotFound { .. } => ErrorKind::NotFound,
            VirtupError::DuplicateTemplate { .. }
            | VirtupError::TemplateInUse { .. }
            | VirtupError::InstanceExists { .. }
            | VirtupError::AlreadyRunning { .. }
            | VirtupError::NotRunning { .. } => ErrorKind::Conflict,
            VirtupError::TransferFailed { .. } | VirtupError::TransferInterrupted { .. } => {
                ErrorKind::Transfer
            }
            VirtupError::DefinitionFailed { .. } => ErrorKind::Definition,
            VirtupError::AddressTimeout { .. } => ErrorKind::Timeout,
            VirtupError::ConsoleUnavailable { .. } => ErrorKind::ConsoleUnavailable,
            VirtupError::ConfigLoad { .. }
            | VirtupError::ConfigParse { .. }
            | VirtupError::Validation { .. }
            | VirtupError::Io { .. }
            | VirtupError::Libvirt { .. }
            | VirtupError::UnexpectedResponse { .. }
            | VirtupError::ExternalCommand { .. } => ErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_class() {
        let kinds = [
            ErrorKind::Other,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::Transfer,
            ErrorKind::Definition,
            ErrorKind::Timeout,
            ErrorKind::ConsoleUnavailable,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn template_in_use_lists_instances() {
        let err = VirtupError::TemplateInUse {
            name: "base".into(),
            instances: vec!["vm1".into(), "vm2".into()],
        };
        assert_eq!(err.to_string(), "template 'base' is still used by: vm1, vm2");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn timeout_is_its_own_class() {
        let err = VirtupError::AddressTimeout {
            name: "vm1".into(),
            timeout: Duration::from_secs(60),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("60s"));
    }
}
