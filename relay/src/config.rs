//! Configuration types and startup validation.

use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Upper bound on configured inputs, keeping stats output and switching
/// rotation manageable.
pub const MAX_SOURCES: usize = 15;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("source does not contain host:port: {0}")]
    BadSource(String),
    #[error("invalid destination spec: {0}")]
    BadDestination(String),
    #[error("no sources given")]
    NoSources,
    #[error("max {MAX_SOURCES} sources supported")]
    TooManySources,
    #[error("no destinations set")]
    NoDestinations,
    #[error("both EDI/UDP and EDI/TCP outputs configured, specify either --with-pft or --without-pft")]
    AmbiguousPft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    #[value(name = "merge")]
    Merging,
    #[value(name = "switch")]
    Switching,
}

/// `host:port` of one upstream encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub hostname: String,
    pub port: u16,
}

impl FromStr for SourceSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hostname, port) = s.rsplit_once(':').ok_or_else(|| ConfigError::BadSource(s.to_string()))?;
        if hostname.is_empty() {
            return Err(ConfigError::BadSource(s.to_string()));
        }
        let port = port.parse().map_err(|_| ConfigError::BadSource(s.to_string()))?;
        Ok(SourceSpec { hostname: hostname.to_string(), port })
    }
}

/// `dest:port[,src=ip][,sport=port][,ttl=n]` for one UDP destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpOutSpec {
    pub dest_addr: IpAddr,
    pub dest_port: u16,
    pub source_addr: Option<IpAddr>,
    pub source_port: Option<u16>,
    pub ttl: Option<u32>,
}

impl FromStr for UdpOutSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::BadDestination(s.to_string());
        let mut parts = s.split(',');
        let dest = parts.next().ok_or_else(bad)?;
        let (addr, port) = dest.rsplit_once(':').ok_or_else(bad)?;
        let mut spec = UdpOutSpec {
            dest_addr: addr.parse().map_err(|_| bad())?,
            dest_port: port.parse().map_err(|_| bad())?,
            source_addr: None,
            source_port: None,
            ttl: None,
        };
        for option in parts {
            let (key, value) = option.split_once('=').ok_or_else(bad)?;
            match key {
                "src" => spec.source_addr = Some(value.parse().map_err(|_| bad())?),
                "sport" => spec.source_port = Some(value.parse().map_err(|_| bad())?),
                "ttl" => spec.ttl = Some(value.parse().map_err(|_| bad())?),
                _ => return Err(bad()),
            }
        }
        Ok(spec)
    }
}

impl From<&UdpOutSpec> for edi_output::UdpDestConfig {
    fn from(spec: &UdpOutSpec) -> Self {
        edi_output::UdpDestConfig {
            dest_addr: spec.dest_addr,
            dest_port: spec.dest_port,
            source_addr: spec.source_addr,
            source_port: spec.source_port,
            ttl: spec.ttl,
        }
    }
}

/// Decides whether the outputs carry PFT fragments or plain AF packets.
/// A UDP-only setup defaults to PFT, a TCP-only setup to plain AF; mixing
/// both requires an explicit operator choice.
pub fn resolve_pft(num_udp: usize, num_tcp: usize, force: Option<bool>) -> Result<bool, ConfigError> {
    match force {
        Some(enable) => Ok(enable),
        None if num_udp > 0 && num_tcp > 0 => Err(ConfigError::AmbiguousPft),
        None if num_udp > 0 => Ok(true),
        None => Ok(false),
    }
}

/// Checks the source list bounds shared by every mode.
pub fn validate_sources(num_sources: usize) -> Result<(), ConfigError> {
    if num_sources == 0 {
        return Err(ConfigError::NoSources);
    }
    if num_sources > MAX_SOURCES {
        return Err(ConfigError::TooManySources);
    }
    Ok(())
}
