use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::error::DistError;

/// Dotted version reduced to `(major, minor, patch)`; missing parts are 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Version3(pub u32, pub u32, pub u32);

impl Version3 {
    pub fn major(self) -> u32 {
        self.0
    }

    pub fn minor(self) -> u32 {
        self.1
    }
}

impl FromStr for Version3 {
    type Err = DistError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || DistError::config(format!("invalid version '{raw}'"));
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }
        let mut parts = [0u32; 3];
        for (index, part) in trimmed.split('.').enumerate() {
            // Components past patch (e.g. build numbers) do not take part in checks.
            if index >= 3 {
                break;
            }
            parts[index] = part.parse().map_err(|_| invalid())?;
        }
        Ok(Version3(parts[0], parts[1], parts[2]))
    }
}

impl TryFrom<String> for Version3 {
    type Error = DistError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Version3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Accepted CUDA runtime range: `min <= version < below`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CudaVersionCheck {
    pub min: Option<Version3>,
    pub below: Option<Version3>,
}

impl CudaVersionCheck {
    pub fn accepts(&self, version: Version3) -> bool {
        self.min.map_or(true, |min| version >= min)
            && self.below.map_or(true, |below| version < below)
    }
}
