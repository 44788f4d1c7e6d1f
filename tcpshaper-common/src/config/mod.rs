mod defaults;

use std::fmt::Display;

use defaults::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{ListenEndpoint, ShaperError};

/// Bytes per second plus the largest single admission, as written in the
/// config file. `0` means unlimited for `bytes_per_second` and "same as the
/// limit" for `burst`.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateConfig {
    #[serde(default = "_default_unlimited")]
    pub bytes_per_second: u64,
    #[serde(default = "_default_unlimited")]
    pub burst: u64,
}

impl RateConfig {
    pub const fn unlimited() -> Self {
        Self {
            bytes_per_second: 0,
            burst: 0,
        }
    }

    pub const fn limited(bytes_per_second: u64, burst: u64) -> Self {
        Self {
            bytes_per_second,
            burst,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_second == 0
    }
}

impl Display for RateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_unlimited() {
            return write!(f, "unlimited");
        }
        let burst = match self.burst {
            0 => self.bytes_per_second,
            b => b,
        };
        write!(f, "{} B/s (burst {} B)", self.bytes_per_second, burst)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectionalRates {
    #[serde(default)]
    pub read: RateConfig,
    #[serde(default)]
    pub write: RateConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ShaperConfig {
    #[serde(default = "_default_listen")]
    pub listen: ListenEndpoint,

    /// `host:port` every shaped connection is relayed to
    pub upstream: String,

    /// Aggregate budget shared by all connections
    #[serde(default)]
    pub server: DirectionalRates,

    /// Budget applied to each connection individually
    #[serde(default)]
    pub connection: DirectionalRates,
}

impl ShaperConfig {
    pub fn validate(&self) -> Result<(), ShaperError> {
        if self.upstream.trim().is_empty() {
            return Err(ShaperError::Config("`upstream` must not be empty".into()));
        }
        let Some((host, port)) = self.upstream.rsplit_once(':') else {
            return Err(ShaperError::Config(format!(
                "`upstream` must be host:port, got {:?}",
                self.upstream
            )));
        };
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(ShaperError::Config(format!(
                "`upstream` must be host:port, got {:?}",
                self.upstream
            )));
        }

        for (scope, rates) in [("server", &self.server), ("connection", &self.connection)] {
            for (direction, rate) in [("read", &rates.read), ("write", &rates.write)] {
                if rate.is_unlimited() && rate.burst != 0 {
                    warn!("{scope}.{direction}.burst is ignored because the rate is unlimited");
                }
            }
        }

        if !self.server.read.is_unlimited()
            && !self.connection.read.is_unlimited()
            && self.connection.read.bytes_per_second > self.server.read.bytes_per_second
        {
            warn!("connection.read exceeds server.read and will never be reached");
        }
        if !self.server.write.is_unlimited()
            && !self.connection.write.is_unlimited()
            && self.connection.write.bytes_per_second > self.server.write.bytes_per_second
        {
            warn!("connection.write exceeds server.write and will never be reached");
        }
        Ok(())
    }
}
