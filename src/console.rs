//! Serial console attach through `virsh console`.

use std::process::Stdio;

use crate::backend::{DomainStatus, Hypervisor};
use crate::domain_xml::DomainDump;
use crate::error::VirtupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// The console session ended on its own (Ctrl+] or guest hangup).
    Closed,
    /// Ctrl+C killed the console client.
    Detached,
}

/// Fail unless `name` is running with a serial or console device.
fn check_console(hv: &impl Hypervisor, name: &str) -> Result<(), VirtupError> {
    match hv.domain_status(name)? {
        None => {
            return Err(VirtupError::InstanceNotFound {
                name: name.to_string(),
            });
        }
        Some(DomainStatus::Running) => {}
        Some(_) => {
            return Err(VirtupError::NotRunning {
                name: name.to_string(),
            });
        }
    }
    if !DomainDump::parse(&hv.domain_xml(name)?)?.has_console {
        return Err(VirtupError::ConsoleUnavailable {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Hand the terminal to `virsh console` until it exits or Ctrl+C.
pub async fn attach(hv: &impl Hypervisor, name: &str) -> Result<ConsoleExit, VirtupError> {
    check_console(hv, name)?;
    println!("Attaching console (press Ctrl+] or Ctrl+C to detach)...");

    tracing::debug!(name, uri = hv.uri(), "spawning virsh console");
    let mut child = tokio::process::Command::new("virsh")
        .args(["-c", hv.uri(), "console", name])
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| VirtupError::Io {
            context: "running virsh console".into(),
            source: e,
        })?;

    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(s) if !s.success() => Err(VirtupError::ExternalCommand {
                    command: "virsh console".into(),
                    message: format!("exited with {s}"),
                }),
                Ok(_) => Ok(ConsoleExit::Closed),
                Err(e) => Err(VirtupError::Io {
                    context: "waiting for virsh console".into(),
                    source: e,
                }),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            if let Err(e) = child.kill().await {
                tracing::warn!("could not kill virsh console: {e}");
            }
            Ok(ConsoleExit::Detached)
        }
    }
}
