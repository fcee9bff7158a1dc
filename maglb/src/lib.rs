//! A layer-4 load balancer forwarding core.
//!
//! Frames are classified against provisioned VIPs, assigned a backend by
//! server id, source prefix, flow cache or consistent-hash ring, and sent
//! on IP-in-IP or GUE encapsulated.

pub mod cache;
pub mod capture;
pub mod checksum;
pub mod config;
pub mod control;
pub mod encap;
pub mod error;
pub mod forwarder;
pub mod hash;
pub mod icmp;
pub mod lpm;
pub mod packet;
pub mod ring;
pub mod server_id;
pub mod stats;
pub mod tables;

pub use error::{Error, Result};
