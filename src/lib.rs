#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod address;
pub mod backend;
pub mod cli;
pub mod config;
pub mod console;
pub mod domain_xml;
pub mod error;
pub mod image;
pub mod lifecycle;
pub mod logging;
pub mod paths;
pub mod progress;
pub mod template;
pub mod util;
pub mod vm_state;
pub mod volume_xml;
