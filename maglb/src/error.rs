use std::net::IpAddr;

use maglb_common::VipDefinition;

/// Errors raised while loading configuration or provisioning tables.
///
/// The packet path never produces these; it reports through
/// [`crate::forwarder::Verdict`] and the statistics counters instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("vip space exhausted ({max} vips)")]
    VipSpaceExhausted { max: u32 },

    #[error("real space exhausted ({max} reals)")]
    RealSpaceExhausted { max: u32 },

    #[error("vip {0:?} already exists")]
    VipExists(VipDefinition),

    #[error("vip {0:?} does not exist")]
    UnknownVip(VipDefinition),

    #[error("real {0} does not exist")]
    UnknownReal(IpAddr),

    #[error("server id {id} out of range (max {max})")]
    ServerIdOutOfRange { id: u32, max: u32 },

    #[error("{table} table full ({max} entries)")]
    TableFull { table: &'static str, max: u32 },

    #[error("ring size {0} is not prime")]
    RingSizeNotPrime(u32),

    #[error("interface {name} not found")]
    InterfaceNotFound { name: String },
}

pub type Result<T> = std::result::Result<T, Error>;
