#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod backend;
pub mod cli;
pub mod cloudinit;
pub mod commands;
pub mod config;
pub mod disks;
pub mod error;
pub mod image;
pub mod paths;
pub mod ssh_keys;
