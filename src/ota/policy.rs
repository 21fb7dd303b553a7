// Server policy - the knobs that decide what a node gets and when
//
// Everything here is configuration. The only mutable per-client policy state
// (negotiated block periods) lives in the rate table.

use ota_core::ImageId;
use serde::{Deserialize, Serialize};

use super::NodeId;

/// APS auxiliary security header plus MIC.
const APS_SECURITY_OVERHEAD: u8 = 9;
/// Source route header: relay count and index, then one short address per relay.
const SOURCE_ROUTE_BASE_OVERHEAD: u8 = 2;
const SOURCE_ROUTE_PER_RELAY: u8 = 2;
/// Frame control, sequence number, command id.
const ZCL_HEADER_OVERHEAD: u8 = 3;
/// Status, image triple, file offset, data size.
const BLOCK_RESPONSE_FIXED_FIELDS: u8 = 14;

/// How a candidate version is compared with the version a node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextVersionPolicy {
    UpgradeIfNewer,
    DowngradeIfOlder,
    ReinstallIfSame,
    /// Never offer anything.
    None,
}

impl NextVersionPolicy {
    pub fn allows(self, candidate: u32, current: u32) -> bool {
        match self {
            NextVersionPolicy::UpgradeIfNewer => candidate > current,
            NextVersionPolicy::DowngradeIfOlder => candidate < current,
            NextVersionPolicy::ReinstallIfSame => candidate == current,
            NextVersionPolicy::None => false,
        }
    }
}

/// What to tell a node that finished downloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeDisposition {
    Now,
    Soon,
    AskLater,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodUnits {
    Milliseconds,
    Seconds,
    /// Value is in milliseconds; each node is tested to learn which units
    /// it applies.
    Discover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPeriod {
    pub value: u16,
    pub units: PeriodUnits,
}

impl BlockPeriod {
    pub fn is_disabled(&self) -> bool {
        self.value == 0
    }

    /// The value a node using seconds should send back.
    pub fn in_seconds(&self) -> u16 {
        match self.units {
            PeriodUnits::Seconds => self.value,
            PeriodUnits::Milliseconds | PeriodUnits::Discover => self.value.div_ceil(1000),
        }
    }
}

/// Route properties towards one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkInfo {
    pub aps_encryption: bool,
    pub relay_count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub next_version: NextVersionPolicy,
    pub min_block_period: BlockPeriod,
    pub page_requests_enabled: bool,
    pub upgrade_end: UpgradeDisposition,
    pub upgrade_soon_delay_secs: u32,
    /// Delay handed out in WaitForData when the server is busy.
    pub busy_retry_secs: u32,
    pub max_clients: usize,
    pub client_timeout_secs: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            next_version: NextVersionPolicy::UpgradeIfNewer,
            min_block_period: BlockPeriod {
                value: 0,
                units: PeriodUnits::Milliseconds,
            },
            page_requests_enabled: true,
            upgrade_end: UpgradeDisposition::Now,
            upgrade_soon_delay_secs: 120,
            busy_retry_secs: 60,
            max_clients: 8,
            client_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub max_aps_payload: u8,
    pub aps_encryption: bool,
    pub default_relay_count: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_aps_payload: 82,
            aps_encryption: true,
            default_relay_count: 0,
        }
    }
}

impl LinkConfig {
    pub fn default_link(&self) -> LinkInfo {
        LinkInfo {
            aps_encryption: self.aps_encryption,
            relay_count: self.default_relay_count,
        }
    }

    /// Largest block that fits one frame towards a destination. Zero when
    /// the overheads eat the whole payload.
    pub fn max_block_size(&self, link: &LinkInfo) -> u8 {
        let mut room = self.max_aps_payload;
        if link.aps_encryption {
            room = room.saturating_sub(APS_SECURITY_OVERHEAD);
        }
        if link.relay_count > 0 {
            let route = SOURCE_ROUTE_BASE_OVERHEAD
                .saturating_add(link.relay_count.saturating_mul(SOURCE_ROUTE_PER_RELAY));
            room = room.saturating_sub(route);
        }
        room.saturating_sub(ZCL_HEADER_OVERHEAD)
            .saturating_sub(BLOCK_RESPONSE_FIXED_FIELDS)
    }
}

/// Decisions the protocol engine delegates.
pub trait ServerPolicy {
    fn next_version(&self) -> NextVersionPolicy;

    /// Whether `candidate` may be offered to a node running `current`.
    fn allow_image(&self, _source: NodeId, current: &ImageId, candidate: &ImageId) -> bool {
        self.next_version()
            .allows(candidate.firmware_version, current.firmware_version)
    }

    fn max_block_size(&self, link: &LinkInfo) -> u8;

    fn default_link(&self) -> LinkInfo;

    fn block_period(&self) -> BlockPeriod;

    fn accept_page_requests(&self) -> bool;

    fn upgrade_end(&self, source: NodeId, image: &ImageId) -> UpgradeDisposition;

    fn upgrade_soon_delay_secs(&self) -> u32;

    fn busy_retry_secs(&self) -> u32;
}

/// Policy driven entirely by the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredPolicy {
    pub policy: PolicyConfig,
    pub link: LinkConfig,
}

impl ConfiguredPolicy {
    pub fn new(policy: PolicyConfig, link: LinkConfig) -> Self {
        Self { policy, link }
    }
}

impl ServerPolicy for ConfiguredPolicy {
    fn next_version(&self) -> NextVersionPolicy {
        self.policy.next_version
    }

    fn max_block_size(&self, link: &LinkInfo) -> u8 {
        self.link.max_block_size(link)
    }

    fn default_link(&self) -> LinkInfo {
        self.link.default_link()
    }

    fn block_period(&self) -> BlockPeriod {
        self.policy.min_block_period
    }

    fn accept_page_requests(&self) -> bool {
        self.policy.page_requests_enabled
    }

    fn upgrade_end(&self, _source: NodeId, _image: &ImageId) -> UpgradeDisposition {
        self.policy.upgrade_end
    }

    fn upgrade_soon_delay_secs(&self) -> u32 {
        self.policy.upgrade_soon_delay_secs
    }

    fn busy_retry_secs(&self) -> u32 {
        self.policy.busy_retry_secs
    }
}
