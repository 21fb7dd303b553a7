// OTA server module - answers mesh nodes pulling firmware images

pub mod policy;
pub mod rate_limiter;
pub mod server;
pub mod verify;
pub mod wire;

pub use policy::{
    BlockPeriod, ConfiguredPolicy, LinkConfig, LinkInfo, NextVersionPolicy, PeriodUnits,
    PolicyConfig, ServerPolicy, UpgradeDisposition,
};
pub use rate_limiter::{ClientRateState, ClientRateTable, ClientUnits};
pub use server::{OtaServer, Reply};
pub use verify::{ImageVerifier, Sha256Verifier, VerifyStatus};
pub use wire::{ClientCommand, ServerCommand, Status, WireError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Download flow as seen from the server:
// 1. Node sends QueryNextImage with its current version
// 2. Server answers with the best image from the catalog, if policy allows
// 3. Node pulls the image with block (or page) requests
// 4. Node verifies the image and sends UpgradeEnd
// 5. Server tells it when to switch over

/// Short mesh address of a node, as delivered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u16);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    /// Hex, with or without a `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        u16::from_str_radix(digits, 16).map(NodeId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parse_and_display() {
        assert_eq!("0x1a2B".parse::<NodeId>().unwrap(), NodeId(0x1A2B));
        assert_eq!("beef".parse::<NodeId>().unwrap(), NodeId(0xBEEF));
        assert!("xyz".parse::<NodeId>().is_err());
        assert_eq!(NodeId(0x00AB).to_string(), "0x00AB");
    }
}
