use std::path::Path;
use std::time::Duration;

use clap::Parser;
use facet::Facet;

use virtup::address;
use virtup::backend::libvirt::LibvirtSession;
use virtup::cli::{Cli, Command};
use virtup::config::{self, Config};
use virtup::console::{self, ConsoleExit};
use virtup::domain_xml;
use virtup::error::VirtupError;
use virtup::lifecycle::{Instance, Lifecycle, StartOutcome, StopOutcome};
use virtup::logging::{self, DeferredFileHandle};
use virtup::paths;
use virtup::template::{TemplateProfile, TemplateStore};
use virtup::util;

#[derive(Facet)]
struct InstanceJson {
    name: String,
    state: String,
    template: Option<String>,
    mac: Option<String>,
    addresses: Vec<String>,
}

impl From<&Instance> for InstanceJson {
    fn from(i: &Instance) -> Self {
        Self {
            name: i.name.clone(),
            state: i.state.to_string(),
            template: i.template.clone(),
            mac: i.mac.clone(),
            addresses: i.addresses.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let file_handle = logging::init(cli.verbose);

    if let Err(e) = run(cli, &file_handle).await {
        let code = e.kind().exit_code();
        tracing::debug!(code, "command failed: {e}");
        eprintln!("{:?}", miette::Report::new(e));
        std::process::exit(code);
    }
}

async fn run(cli: Cli, file_handle: &DeferredFileHandle) -> Result<(), VirtupError> {
    let config = config::load_config(cli.config.as_deref())?;
    let uri = cli.uri.clone().unwrap_or_else(|| config.libvirt.uri.clone());

    match cli.command {
        Command::Import {
            name,
            image,
            pool,
            resources,
        } => {
            domain_xml::validate_name("template", &name)?;
            let overrides = resources.overrides(None);
            overrides.resolve(&config.defaults()?)?;
            let pool = pool.unwrap_or_else(|| config.storage.pool.clone());
            let session = open(&uri, file_handle)?;
            let profile = TemplateProfile::from_overrides(&overrides);
            import(&session, &pool, &name, &image, &profile).await
        }
        Command::Templates { pool } => {
            let pool = pool.unwrap_or_else(|| config.storage.pool.clone());
            let session = open(&uri, file_handle)?;
            list_templates(&session, &pool)
        }
        Command::Remove { name, pool } => {
            let pool = pool.unwrap_or_else(|| config.storage.pool.clone());
            let session = open(&uri, file_handle)?;
            TemplateStore::new(&session, &pool).remove(&name)?;
            println!("Removed template '{name}' from pool '{pool}'");
            Ok(())
        }
        Command::Create {
            name,
            template,
            resources,
            mac,
        } => {
            domain_xml::validate_name("instance", &name)?;
            let overrides = resources.overrides(mac);
            overrides.resolve(&config.defaults()?)?;
            let session = open(&uri, file_handle)?;
            let instance = lifecycle(&session, &config)?.create(&name, &template, &overrides)?;
            println!(
                "Created instance '{}' from template '{template}' (mac {})",
                instance.name,
                instance.mac.as_deref().unwrap_or("-"),
            );
            Ok(())
        }
        Command::Up {
            name,
            strict,
            no_wait,
            timeout,
        } => {
            let session = open(&uri, file_handle)?;
            match lifecycle(&session, &config)?.start(&name, strict)? {
                StartOutcome::Started => println!("Started '{name}'"),
                StartOutcome::AlreadyRunning => println!("'{name}' is already running"),
            }
            if no_wait {
                return Ok(());
            }
            let addr = address::resolve_address(
                &session,
                &name,
                address_timeout(timeout, &config),
                config.poll_interval(),
            )
            .await?;
            println!("{addr}");
            Ok(())
        }
        Command::Down { name } => {
            let session = open(&uri, file_handle)?;
            match lifecycle(&session, &config)?.stop(&name).await? {
                StopOutcome::Graceful => println!("Stopped '{name}'"),
                StopOutcome::Forced => println!("Force stopped '{name}' after shutdown timeout"),
            }
            Ok(())
        }
        Command::Destroy { name } => {
            let session = open(&uri, file_handle)?;
            lifecycle(&session, &config)?.destroy(&name)?;
            println!("Destroyed '{name}'");
            Ok(())
        }
        Command::Ip { name, timeout } => {
            let session = open(&uri, file_handle)?;
            let addr = address::resolve_address(
                &session,
                &name,
                address_timeout(timeout, &config),
                config.poll_interval(),
            )
            .await?;
            println!("{addr}");
            Ok(())
        }
        Command::Console { name } => {
            let session = open(&uri, file_handle)?;
            if console::attach(&session, &name).await? == ConsoleExit::Detached {
                println!("\nDetached from console. '{name}' is still running.");
            }
            Ok(())
        }
        Command::Status { name, json } => {
            let session = open(&uri, file_handle)?;
            let lc = lifecycle(&session, &config)?;
            match name {
                Some(name) => {
                    let instance = lc.status(&name)?;
                    if json {
                        println!(
                            "{}",
                            facet_json::to_string(&InstanceJson::from(&instance))
                                .expect("JSON serialization")
                        );
                    } else {
                        print_instance(&instance);
                    }
                }
                None => {
                    let instances = lc.list()?;
                    if json {
                        let rows: Vec<InstanceJson> = instances.iter().map(Into::into).collect();
                        println!(
                            "{}",
                            facet_json::to_string(&rows).expect("JSON serialization")
                        );
                    } else if instances.is_empty() {
                        println!("No instances defined.");
                    } else {
                        for instance in &instances {
                            print_instance(instance);
                        }
                    }
                }
            }
            Ok(())
        }
    }
}

/// Connect to libvirt and start the file log.
fn open(uri: &str, file_handle: &DeferredFileHandle) -> Result<LibvirtSession, VirtupError> {
    let log = paths::log_path();
    if let Err(e) = file_handle.set_file(&log) {
        tracing::warn!(path = %log.display(), "file logging disabled: {e}");
    }
    LibvirtSession::open(uri)
}

fn lifecycle<'h>(
    session: &'h LibvirtSession,
    config: &Config,
) -> Result<Lifecycle<'h, LibvirtSession>, VirtupError> {
    Ok(Lifecycle::new(session, &config.storage.pool)
        .with_defaults(config.defaults()?)
        .with_shutdown_timeout(config.shutdown_timeout(), config.poll_interval()))
}

fn address_timeout(flag: Option<u64>, config: &Config) -> Duration {
    flag.map(Duration::from_secs)
        .unwrap_or_else(|| config.address_timeout())
}

async fn import(
    session: &LibvirtSession,
    pool: &str,
    name: &str,
    image: &Path,
    profile: &TemplateProfile,
) -> Result<(), VirtupError> {
    let store = TemplateStore::new(session, pool);
    let template = store.import(name, image, profile).await?;
    println!(
        "Imported '{}' into pool '{}' as {} ({}, {})",
        image.display(),
        store.pool(),
        template.volume,
        template.format,
        util::format_size(template.capacity),
    );
    println!("Template descriptor: {}", store.profile_path(name).display());
    Ok(())
}

fn list_templates(session: &LibvirtSession, pool: &str) -> Result<(), VirtupError> {
    let templates = TemplateStore::new(session, pool).list()?;
    if templates.is_empty() {
        println!("No templates in pool '{pool}'.");
        return Ok(());
    }
    println!("{:<24} {:<8} {:>10}", "NAME", "FORMAT", "SIZE");
    for t in &templates {
        println!(
            "{:<24} {:<8} {:>10}",
            t.name,
            t.format.as_str(),
            util::format_size(t.capacity)
        );
    }
    Ok(())
}

fn print_instance(instance: &Instance) {
    println!("{}: {}", instance.name, instance.state);
    if let Some(template) = &instance.template {
        println!("  Template: {template}");
    }
    if let Some(mac) = &instance.mac {
        println!("  MAC: {mac}");
    }
    for addr in &instance.addresses {
        println!("  IP: {addr}");
    }
}
