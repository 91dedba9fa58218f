#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod bootloader;

pub mod cache;

pub mod config;

pub mod device;

pub mod error;

pub mod exec;

pub mod hypervisor;

pub mod id;

pub mod image;

pub mod network;

pub mod platform;

pub mod port;

pub mod process_spawner;

pub mod registry;

pub mod shim;

pub mod vm;

pub mod vsock;
