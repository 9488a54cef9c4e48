//! Pass-through name server resolver.
//!
//! Addresses are used exactly as configured; there is no discovery step.

use super::{BrokerError, Result};

/// Resolver that hands back the configured addresses unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassthroughResolver {
    addresses: Vec<String>,
}

impl PassthroughResolver {
    /// Validate and wrap broker addresses.
    ///
    /// Each address must be `host:port` with a numeric port. An optional
    /// `scheme://` prefix is accepted and kept.
    pub fn new(addresses: Vec<String>) -> Result<Self> {
        if addresses.is_empty() {
            return Err(BrokerError::InvalidAddress {
                address: String::new(),
                reason: "no broker addresses configured".to_string(),
            });
        }
        for address in &addresses {
            validate(address)?;
        }
        Ok(Self { addresses })
    }

    pub fn resolve(&self) -> &[String] {
        &self.addresses
    }

    /// Addresses joined with `,` (bootstrap-list form).
    pub fn joined(&self) -> String {
        self.addresses.join(",")
    }
}

fn validate(address: &str) -> Result<()> {
    let invalid = |reason: &str| BrokerError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let hostport = match address.split_once("://") {
        Some((_, rest)) => rest,
        None => address,
    };
    let (host, port) = hostport
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;
    Ok(())
}
