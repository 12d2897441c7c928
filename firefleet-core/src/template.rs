use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Upper bound on vCPUs accepted by Firecracker.
pub const MAX_VCPUS: u32 = 32;

/// Resource template a VM is cloned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmTemplate {
    /// Number of virtual CPUs.
    pub cpu: u32,
    /// Guest memory in MiB.
    pub ram: u32,
    /// Size of the derived root disk, e.g. `"2G"`.
    pub storage: StorageSize,
    /// Host path of the kernel image to stage.
    pub kernel_image: PathBuf,
    /// Host path of the root filesystem image to stage.
    pub rootfs_image: PathBuf,
}

impl VmTemplate {
    /// Check sizing and image paths.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidField`] naming the offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.cpu == 0 || self.cpu > MAX_VCPUS {
            return Err(CoreError::field(
                "template.cpu",
                format!("must be between 1 and {MAX_VCPUS}, got {}", self.cpu),
            ));
        }
        if self.ram == 0 {
            return Err(CoreError::field("template.ram", "must be greater than zero"));
        }
        if self.kernel_image.file_name().is_none() {
            return Err(CoreError::field("template.kernel_image", "must name a file"));
        }
        if self.rootfs_image.file_name().is_none() {
            return Err(CoreError::field("template.rootfs_image", "must name a file"));
        }
        Ok(())
    }
}

/// A disk size written the way `truncate -s` expects it: digits plus an
/// optional `K`, `M`, `G` or `T` suffix (binary multiples).
///
/// Keeps the normalised text form so it can be handed to the storage
/// collaborator unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageSize {
    text: String,
    bytes: u64,
}

impl StorageSize {
    /// Parse a size such as `"512M"` or `"2G"`.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidStorageSize`] for empty, zero, unknown-unit
    /// or overflowing values.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidStorageSize {
            value: value.to_owned(),
            reason: reason.to_owned(),
        };

        let trimmed = value.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        if digits.is_empty() {
            return Err(invalid("missing number"));
        }
        let number: u64 = digits.parse().map_err(|_| invalid("number too large"))?;
        if number == 0 {
            return Err(invalid("size must be greater than zero"));
        }

        let unit = unit.to_ascii_uppercase();
        let (suffix, shift) = match unit.as_str() {
            "" => ("", 0),
            "K" => ("K", 10),
            "M" => ("M", 20),
            "G" => ("G", 30),
            "T" => ("T", 40),
            _ => return Err(invalid("unit must be one of K, M, G, T")),
        };
        let bytes = number
            .checked_mul(1u64 << shift)
            .ok_or_else(|| invalid("size overflows 64 bits"))?;

        Ok(Self { text: format!("{number}{suffix}"), bytes })
    }

    /// Normalised text form, e.g. `"2G"`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Size in bytes.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl fmt::Display for StorageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for StorageSize {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for StorageSize {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StorageSize> for String {
    fn from(size: StorageSize) -> Self {
        size.text
    }
}
