use serde::{Deserialize, Serialize};
use std::fmt;

/// IEEE 802.15.4 extended address, stored in over-the-air (little-endian) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Eui64(pub [u8; 8]);

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Conventionally printed most significant byte first
        for b in self.0.iter().rev() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// Identifies one firmware image within a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId {
    pub manufacturer_id: u16,
    pub image_type_id: u16,
    pub firmware_version: u32,
    pub device_specific: Option<Eui64>,
}

impl ImageId {
    pub const INVALID: ImageId = ImageId {
        manufacturer_id: 0xFFFF,
        image_type_id: 0xFFFF,
        firmware_version: 0xFFFF_FFFF,
        device_specific: None,
    };

    pub fn new(manufacturer_id: u16, image_type_id: u16, firmware_version: u32) -> Self {
        Self {
            manufacturer_id,
            image_type_id,
            firmware_version,
            device_specific: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        !(self.manufacturer_id == 0xFFFF
            && self.image_type_id == 0xFFFF
            && self.firmware_version == 0xFFFF_FFFF)
    }

    /// Same manufacturer and image type, any version.
    pub fn same_product(&self, other: &ImageId) -> bool {
        self.manufacturer_id == other.manufacturer_id && self.image_type_id == other.image_type_id
    }

    /// The triple carried on the wire; the device-specific address is not
    /// part of the over-the-air identifier.
    pub fn matches_triple(&self, other: &ImageId) -> bool {
        self.same_product(other) && self.firmware_version == other.firmware_version
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}-{:04X}-{:08X}",
            self.manufacturer_id, self.image_type_id, self.firmware_version
        )?;
        if let Some(eui) = self.device_specific {
            write!(f, "@{}", eui)?;
        }
        Ok(())
    }
}
