//! Creation request accepted by the engine and the HTTP gateway.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::OwnerId;
use crate::template::VmTemplate;

/// Longest hostname accepted (RFC 1123).
const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// A request to provision one microVM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmRequest {
    /// Owner the VM is grouped under.
    pub user_id: i64,
    /// Free-form caller label.
    pub identifier: i64,
    /// Guest IPv4 address, optionally with prefix length (`192.168.5.8/24`).
    pub ip_addr: String,
    pub hostname: String,
    /// Guest default gateway.
    pub gateway: String,
    /// Public key installed into the guest's `authorized_keys`.
    pub ssh_key: String,
    pub template: VmTemplate,
}

impl CreateVmRequest {
    /// The owner as a typed id.
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        OwnerId::new(self.user_id)
    }

    /// Check addressing formats and the template.
    ///
    /// Only syntax is checked here; address uniqueness across VMs belongs to
    /// whichever IP-management layer hands out guest addresses.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidField`] naming the first offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_ip_with_prefix(&self.ip_addr)?;
        self.gateway
            .parse::<Ipv4Addr>()
            .map_err(|e| CoreError::field("gateway", format!("'{}': {e}", self.gateway)))?;
        validate_hostname(&self.hostname)?;
        if self.ssh_key.contains(['\n', '\r', '\0']) {
            return Err(CoreError::field("ssh_key", "must be a single line"));
        }
        self.template.validate()
    }
}

fn validate_ip_with_prefix(value: &str) -> Result<(), CoreError> {
    let (addr, prefix) = match value.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (value, None),
    };
    addr.parse::<Ipv4Addr>()
        .map_err(|e| CoreError::field("ip_addr", format!("'{value}': {e}")))?;
    if let Some(prefix) = prefix {
        match prefix.parse::<u8>() {
            Ok(len) if len <= 32 => {}
            _ => {
                return Err(CoreError::field(
                    "ip_addr",
                    format!("'{value}': prefix length must be 0-32"),
                ))
            }
        }
    }
    Ok(())
}

fn validate_hostname(value: &str) -> Result<(), CoreError> {
    if value.is_empty() || value.len() > MAX_HOSTNAME_LEN {
        return Err(CoreError::field(
            "hostname",
            format!("length must be 1-{MAX_HOSTNAME_LEN}"),
        ));
    }
    for label in value.split('.') {
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(CoreError::field("hostname", format!("invalid label '{label}'")));
        }
    }
    Ok(())
}
