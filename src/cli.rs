use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::domain_xml::Overrides;

#[derive(Parser, Debug)]
#[command(
    name = "virtup",
    version,
    about = "Manage VM templates and instances on libvirt"
)]
pub struct Cli {
    /// Path to config file [default: virtup.toml, if present]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// libvirt connection URI (overrides config)
    #[arg(long, global = true)]
    pub uri: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Resource overrides shared by `import` and `create`.
#[derive(Args, Debug, Clone, Default)]
pub struct ResourceArgs {
    /// Memory, e.g. 1G, 512M, or plain MiB
    #[arg(long)]
    pub memory: Option<String>,

    /// Number of virtual CPUs
    #[arg(long)]
    pub vcpus: Option<u32>,

    /// network:<name> or bridge:<iface>
    #[arg(long)]
    pub network: Option<String>,
}

impl ResourceArgs {
    pub fn overrides(&self, mac: Option<String>) -> Overrides {
        Overrides {
            memory: self.memory.clone(),
            vcpus: self.vcpus,
            network: self.network.clone(),
            mac,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Import a local disk image as a template
    Import {
        /// Template name
        name: String,

        /// Disk image to upload (raw or qcow2)
        #[arg(long)]
        image: PathBuf,

        /// Storage pool (overrides config)
        #[arg(long)]
        pool: Option<String>,

        #[command(flatten)]
        resources: ResourceArgs,
    },

    /// List templates in a pool
    Templates {
        #[arg(long)]
        pool: Option<String>,
    },

    /// Remove a template
    Remove {
        name: String,

        #[arg(long)]
        pool: Option<String>,
    },

    /// Create an instance from a template
    Create {
        /// Instance name
        name: String,

        /// Template to clone
        #[arg(short, long)]
        template: String,

        #[command(flatten)]
        resources: ResourceArgs,

        /// MAC address for the instance NIC [default: random 00:16:3e:xx:xx:xx]
        #[arg(long)]
        mac: Option<String>,
    },

    /// Start an instance and print its address
    Up {
        name: String,

        /// Fail if the instance is already running
        #[arg(long)]
        strict: bool,

        /// Don't wait for an address
        #[arg(long)]
        no_wait: bool,

        /// Seconds to wait for an address (overrides config)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Gracefully stop an instance
    Down { name: String },

    /// Force stop an instance and delete it with its disk
    Destroy { name: String },

    /// Print an instance's IPv4 address
    Ip {
        name: String,

        /// Seconds to wait for an address (overrides config)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Attach to an instance's serial console
    Console { name: String },

    /// Show instance state
    Status {
        /// Instance name [default: all instances]
        name: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn create_collects_overrides() {
        let cli = Cli::try_parse_from([
            "virtup", "create", "vm1", "--template", "base", "--memory", "1G", "--vcpus", "2",
            "--mac", "00:16:3e:00:00:01",
        ])
        .unwrap();
        let Command::Create {
            name,
            template,
            resources,
            mac,
        } = cli.command
        else {
            panic!("expected create");
        };
        assert_eq!(name, "vm1");
        assert_eq!(template, "base");
        let o = resources.overrides(mac);
        assert_eq!(o.memory.as_deref(), Some("1G"));
        assert_eq!(o.vcpus, Some(2));
        assert_eq!(o.network, None);
        assert_eq!(o.mac.as_deref(), Some("00:16:3e:00:00:01"));
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["virtup", "status", "--uri", "qemu:///session", "-v"]).unwrap();
        assert_eq!(cli.uri.as_deref(), Some("qemu:///session"));
        assert!(cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn create_requires_template() {
        assert!(Cli::try_parse_from(["virtup", "create", "vm1"]).is_err());
    }
}
