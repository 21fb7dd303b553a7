use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ota::{LinkConfig, PolicyConfig, ServerPolicy};
use crate::storage::{
    DirectoryStore, ImageCatalog, PageEraseLayout, PageEraseStore, RamFlash, SingleSlotStore,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
    pub storage: StorageConfig,
    pub policy: PolicyConfig,
    pub link: LinkConfig,
}

/// Where images live. The flash-backed variants use an in-memory device
/// when run on a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    Directory {
        path: PathBuf,
        max_image_size: u32,
    },
    PageErase {
        capacity: u32,
        page_size: u32,
        start_address: u32,
        region_size: u32,
        reserved_prefix: u32,
        bytemask_address: u32,
        /// Polls an erase stays busy for.
        erase_ticks: u32,
    },
    SingleSlot {
        capacity: u32,
    },
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            storage: StorageConfig::Directory {
                path: PathBuf::from("ota-images"),
                max_image_size: 1024 * 1024,
            },
            policy: PolicyConfig::default(),
            link: LinkConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn open(&self) -> Result<Box<dyn ImageCatalog>> {
        Ok(match self {
            StorageConfig::Directory {
                path,
                max_image_size,
            } => Box::new(
                DirectoryStore::open(path, *max_image_size)
                    .with_context(|| format!("opening image directory {}", path.display()))?,
            ),
            StorageConfig::PageErase {
                capacity,
                page_size,
                erase_ticks,
                ..
            } => {
                let device = RamFlash::nor(*capacity, *page_size, *erase_ticks);
                let layout = self.page_erase_layout().context("page-erase layout")?;
                Box::new(PageEraseStore::open(device, layout).context("opening flash store")?)
            }
            StorageConfig::SingleSlot { capacity } => {
                Box::new(SingleSlotStore::open(RamFlash::eeprom(*capacity)))
            }
        })
    }

    fn page_erase_layout(&self) -> Option<PageEraseLayout> {
        match *self {
            StorageConfig::PageErase {
                start_address,
                region_size,
                reserved_prefix,
                bytemask_address,
                ..
            } => Some(PageEraseLayout {
                start_address,
                region_size,
                reserved_prefix,
                bytemask_address,
            }),
            _ => None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        match &self.storage {
            StorageConfig::Directory { max_image_size, .. } => {
                if *max_image_size == 0 {
                    bail!("max_image_size must be non-zero");
                }
            }
            StorageConfig::PageErase {
                capacity,
                page_size,
                ..
            } => {
                if let Some(layout) = self.storage.page_erase_layout() {
                    layout.validate(*capacity, *page_size)?;
                }
            }
            StorageConfig::SingleSlot { capacity } => {
                if *capacity == 0 {
                    bail!("single-slot capacity must be non-zero");
                }
            }
        }

        let policy = crate::ota::ConfiguredPolicy::new(self.policy.clone(), self.link.clone());
        if policy.max_block_size(&policy.default_link()) == 0 {
            bail!(
                "link payload of {} bytes leaves no room for image data",
                self.link.max_aps_payload
            );
        }
        if self.policy.max_clients == 0 {
            bail!("max_clients must be at least 1");
        }
        if crate::logging::parse_level(&self.log_level).is_none() {
            bail!("unknown log level '{}'", self.log_level);
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        log::info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// Load the config file, falling back to defaults when it is missing or
/// unreadable. A config that parses but makes no sense is an error.
pub fn load_or_default(path: &Path) -> Result<ServerConfig> {
    let config = match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<ServerConfig>(&raw) {
            Ok(config) => {
                log::info!("Loaded configuration from {}", path.display());
                config
            }
            Err(e) => {
                log::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                ServerConfig::default()
            }
        },
        Err(e) => {
            log::warn!("Cannot read {}: {}, using defaults", path.display(), e);
            ServerConfig::default()
        }
    };
    config.validate()?;
    Ok(config)
}
