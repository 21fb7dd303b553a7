//! OTA file header.
//!
//! Layout (all numeric fields little-endian):
//! ```text
//! Offset | Size | Field
//! -------|------|------------------------------------------
//! 0      | 4    | magic (0x0BEEF11E)
//! 4      | 2    | header version
//! 6      | 2    | header length
//! 8      | 2    | field control
//! 10     | 2    | manufacturer id
//! 12     | 2    | image type id
//! 14     | 4    | firmware version
//! 18     | 2    | stack version
//! 20     | 32   | header string (not NUL terminated)
//! 52     | 4    | total image size, header included
//! 56     | 1    | security credential version   (field control bit 0)
//! ..     | 8/16 | upgrade file destination      (field control bit 1)
//! ..     | 2+2  | min / max hardware version    (field control bit 2)
//! ```
//! Optional fields carry no length prefix; their position depends only on
//! which of the preceding bits are set.

use crate::cursor::{ByteReader, ByteWriter};
use crate::error::FormatError;
use crate::image_id::{Eui64, ImageId};

pub const MAGIC: u32 = 0x0BEE_F11E;
pub const HEADER_STRING_LENGTH: usize = 32;
pub const FIXED_HEADER_LENGTH: u16 = 56;
/// Largest header any supported version can produce.
pub const MAX_HEADER_LENGTH: usize = FIXED_HEADER_LENGTH as usize + 1 + 16 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderVersion {
    Zigbee,
    Thread,
}

impl HeaderVersion {
    pub fn from_raw(raw: u16) -> Result<Self, FormatError> {
        match raw {
            0x0100 => Ok(HeaderVersion::Zigbee),
            0x0200 => Ok(HeaderVersion::Thread),
            other => Err(FormatError::UnsupportedHeaderVersion(other)),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            HeaderVersion::Zigbee => 0x0100,
            HeaderVersion::Thread => 0x0200,
        }
    }

    /// Width of the upgrade-file-destination field for this version.
    pub fn destination_length(self) -> usize {
        match self {
            HeaderVersion::Zigbee => 8,
            HeaderVersion::Thread => 16,
        }
    }
}

/// Field control bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldControl(pub u16);

impl FieldControl {
    pub const SECURITY_CREDENTIALS: u16 = 0x0001;
    pub const UPGRADE_FILE_DESTINATION: u16 = 0x0002;
    pub const HARDWARE_VERSIONS: u16 = 0x0004;

    pub fn has(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    /// Combined size of the optional fields selected by this mask.
    pub fn optional_length(self, version: HeaderVersion) -> u16 {
        let mut len = 0;
        if self.has(Self::SECURITY_CREDENTIALS) {
            len += 1;
        }
        if self.has(Self::UPGRADE_FILE_DESTINATION) {
            len += version.destination_length() as u16;
        }
        if self.has(Self::HARDWARE_VERSIONS) {
            len += 4;
        }
        len
    }
}

/// Device the image is meant for, when the file is device specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeDestination {
    Eui64(Eui64),
    Extended([u8; 16]),
}

impl UpgradeDestination {
    pub fn len(&self) -> usize {
        match self {
            UpgradeDestination::Eui64(_) => 8,
            UpgradeDestination::Extended(_) => 16,
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn write(&self, w: &mut ByteWriter) {
        match self {
            UpgradeDestination::Eui64(eui) => w.bytes(&eui.0),
            UpgradeDestination::Extended(addr) => w.bytes(addr),
        };
    }
}

/// Inclusive hardware version range an image supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareVersions {
    pub min: u16,
    pub max: u16,
}

impl HardwareVersions {
    pub fn contains(&self, version: u16) -> bool {
        self.min <= version && version <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub header_version: HeaderVersion,
    pub manufacturer_id: u16,
    pub image_type_id: u16,
    pub firmware_version: u32,
    pub stack_version: u16,
    pub header_string: [u8; HEADER_STRING_LENGTH],
    pub image_size: u32,
    pub security_credentials: Option<u8>,
    pub upgrade_destination: Option<UpgradeDestination>,
    pub hardware_versions: Option<HardwareVersions>,
}

impl Header {
    /// A Zigbee-version header with no optional fields. `image_size` starts
    /// out as the header length and is normally fixed up by the builder.
    pub fn new(manufacturer_id: u16, image_type_id: u16, firmware_version: u32) -> Self {
        Self {
            header_version: HeaderVersion::Zigbee,
            manufacturer_id,
            image_type_id,
            firmware_version,
            stack_version: 0x0002,
            header_string: [0u8; HEADER_STRING_LENGTH],
            image_size: FIXED_HEADER_LENGTH as u32,
            security_credentials: None,
            upgrade_destination: None,
            hardware_versions: None,
        }
    }

    pub fn field_control(&self) -> FieldControl {
        let mut bits = 0;
        if self.security_credentials.is_some() {
            bits |= FieldControl::SECURITY_CREDENTIALS;
        }
        if self.upgrade_destination.is_some() {
            bits |= FieldControl::UPGRADE_FILE_DESTINATION;
        }
        if self.hardware_versions.is_some() {
            bits |= FieldControl::HARDWARE_VERSIONS;
        }
        FieldControl(bits)
    }

    /// On-disk header length implied by the optional fields present.
    pub fn header_length(&self) -> u16 {
        let optional: u16 = self.security_credentials.map_or(0, |_| 1)
            + self.upgrade_destination.map_or(0, |d| d.len() as u16)
            + self.hardware_versions.map_or(0, |_| 4);
        FIXED_HEADER_LENGTH + optional
    }

    pub fn image_id(&self) -> ImageId {
        ImageId {
            manufacturer_id: self.manufacturer_id,
            image_type_id: self.image_type_id,
            firmware_version: self.firmware_version,
            device_specific: match self.upgrade_destination {
                Some(UpgradeDestination::Eui64(eui)) => Some(eui),
                _ => None,
            },
        }
    }

    /// Header string up to the first NUL, never longer than the field.
    pub fn header_string_lossy(&self) -> String {
        let end = self
            .header_string
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(HEADER_STRING_LENGTH);
        String::from_utf8_lossy(&self.header_string[..end]).into_owned()
    }

    pub fn set_header_string(&mut self, text: &str) {
        self.header_string = [0u8; HEADER_STRING_LENGTH];
        let bytes = text.as_bytes();
        let len = bytes.len().min(HEADER_STRING_LENGTH);
        self.header_string[..len].copy_from_slice(&bytes[..len]);
    }

    /// Whether a client reporting `hardware_version` may take this image.
    /// Images without a range, and clients that do not report a version,
    /// are always compatible.
    pub fn supports_hardware(&self, hardware_version: Option<u16>) -> bool {
        match (self.hardware_versions, hardware_version) {
            (Some(range), Some(version)) => range.contains(version),
            _ => true,
        }
    }

    /// The destination field must match the width the header version uses.
    pub fn is_consistent(&self) -> bool {
        match self.upgrade_destination {
            Some(dest) => dest.len() == self.header_version.destination_length(),
            None => true,
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Header, FormatError> {
        let mut r = ByteReader::new(raw);

        let magic = r.u32_le()?;
        if magic != MAGIC {
            return Err(FormatError::MagicMismatch(magic));
        }
        let header_version = HeaderVersion::from_raw(r.u16_le()?)?;
        let declared_length = r.u16_le()?;
        let field_control = FieldControl(r.u16_le()?);
        let manufacturer_id = r.u16_le()?;
        let image_type_id = r.u16_le()?;
        let firmware_version = r.u32_le()?;
        let stack_version = r.u16_le()?;
        let header_string = r.array::<HEADER_STRING_LENGTH>()?;
        let image_size = r.u32_le()?;

        let security_credentials = if field_control.has(FieldControl::SECURITY_CREDENTIALS) {
            Some(r.u8()?)
        } else {
            None
        };

        let upgrade_destination = if field_control.has(FieldControl::UPGRADE_FILE_DESTINATION) {
            Some(match header_version {
                HeaderVersion::Zigbee => UpgradeDestination::Eui64(Eui64(r.array()?)),
                HeaderVersion::Thread => UpgradeDestination::Extended(r.array()?),
            })
        } else {
            None
        };

        let hardware_versions = if field_control.has(FieldControl::HARDWARE_VERSIONS) {
            Some(HardwareVersions {
                min: r.u16_le()?,
                max: r.u16_le()?,
            })
        } else {
            None
        };

        let actual = r.position() as u16;
        if actual != declared_length {
            return Err(FormatError::HeaderLengthMismatch {
                declared: declared_length,
                actual,
            });
        }

        Ok(Header {
            header_version,
            manufacturer_id,
            image_type_id,
            firmware_version,
            stack_version,
            header_string,
            image_size,
            security_credentials,
            upgrade_destination,
            hardware_versions,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(self.header_length() as usize);
        w.u32_le(MAGIC)
            .u16_le(self.header_version.raw())
            .u16_le(self.header_length())
            .u16_le(self.field_control().0)
            .u16_le(self.manufacturer_id)
            .u16_le(self.image_type_id)
            .u32_le(self.firmware_version)
            .u16_le(self.stack_version)
            .bytes(&self.header_string)
            .u32_le(self.image_size);
        if let Some(credentials) = self.security_credentials {
            w.u8(credentials);
        }
        if let Some(dest) = &self.upgrade_destination {
            dest.write(&mut w);
        }
        if let Some(hw) = self.hardware_versions {
            w.u16_le(hw.min).u16_le(hw.max);
        }
        w.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Header {
        let mut h = Header::new(0x1002, 0x5678, 0x0000_0005);
        h.set_header_string("mesh node fw");
        h.image_size = 200;
        h
    }

    #[test]
    fn test_fixed_offsets() {
        let bytes = sample().encode();
        assert_eq!(bytes.len(), 56);
        assert_eq!(&bytes[0..4], &[0x1E, 0xF1, 0xEE, 0x0B]);
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 56);
        assert_eq!(u16::from_le_bytes([bytes[10], bytes[11]]), 0x1002);
        assert_eq!(u32::from_le_bytes([bytes[14], bytes[15], bytes[16], bytes[17]]), 5);
        assert_eq!(&bytes[20..32], b"mesh node fw");
        assert_eq!(u32::from_le_bytes([bytes[52], bytes[53], bytes[54], bytes[55]]), 200);
    }

    #[test]
    fn test_hardware_versions_only_offset() {
        // Without the earlier optional fields the range sits right after the fixed part
        let mut h = sample();
        h.hardware_versions = Some(HardwareVersions { min: 2, max: 5 });
        let bytes = h.encode();
        assert_eq!(bytes.len(), 60);
        assert_eq!(u16::from_le_bytes([bytes[8], bytes[9]]), FieldControl::HARDWARE_VERSIONS);
        assert_eq!(&bytes[56..60], &[2, 0, 5, 0]);
    }

    #[test]
    fn test_bad_magic_rejected_first() {
        let mut bytes = sample().encode();
        bytes[0] = 0;
        bytes[4] = 0x77; // also a bad version; magic wins
        assert!(matches!(Header::decode(&bytes), Err(FormatError::MagicMismatch(_))));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = sample().encode();
        bytes[4..6].copy_from_slice(&0x0300u16.to_le_bytes());
        assert_eq!(
            Header::decode(&bytes),
            Err(FormatError::UnsupportedHeaderVersion(0x0300))
        );
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut bytes = sample().encode();
        bytes[6..8].copy_from_slice(&60u16.to_le_bytes());
        assert_eq!(
            Header::decode(&bytes),
            Err(FormatError::HeaderLengthMismatch { declared: 60, actual: 56 })
        );
    }

    #[test]
    fn test_truncated_optional_field() {
        let mut h = sample();
        h.hardware_versions = Some(HardwareVersions { min: 1, max: 1 });
        let bytes = h.encode();
        assert!(matches!(
            Header::decode(&bytes[..58]),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_header_string_not_nul_terminated() {
        let mut h = sample();
        h.set_header_string("0123456789abcdef0123456789abcdefXYZ");
        assert_eq!(h.header_string_lossy(), "0123456789abcdef0123456789abcdef");
        let decoded = Header::decode(&h.encode()).unwrap();
        assert_eq!(decoded.header_string_lossy().len(), HEADER_STRING_LENGTH);
    }

    #[test]
    fn test_thread_destination_width() {
        let mut h = sample();
        h.header_version = HeaderVersion::Thread;
        h.upgrade_destination = Some(UpgradeDestination::Extended([0xAB; 16]));
        assert!(h.is_consistent());
        assert_eq!(h.header_length(), 72);
        assert_eq!(Header::decode(&h.encode()).unwrap(), h);
    }

    fn arb_header() -> impl Strategy<Value = Header> {
        (
            any::<bool>(),
            any::<(u16, u16, u32, u16, u32)>(),
            any::<[u8; 32]>(),
            proptest::option::of(any::<u8>()),
            proptest::option::of(any::<[u8; 16]>()),
            proptest::option::of(any::<(u16, u16)>()),
        )
            .prop_map(|(thread, (mfg, ty, ver, stack, size), text, sec, dest, hw)| {
                let header_version = if thread {
                    HeaderVersion::Thread
                } else {
                    HeaderVersion::Zigbee
                };
                let upgrade_destination = dest.map(|addr| match header_version {
                    HeaderVersion::Zigbee => {
                        let mut eui = [0u8; 8];
                        eui.copy_from_slice(&addr[..8]);
                        UpgradeDestination::Eui64(Eui64(eui))
                    }
                    HeaderVersion::Thread => UpgradeDestination::Extended(addr),
                });
                Header {
                    header_version,
                    manufacturer_id: mfg,
                    image_type_id: ty,
                    firmware_version: ver,
                    stack_version: stack,
                    header_string: text,
                    image_size: size,
                    security_credentials: sec,
                    upgrade_destination,
                    hardware_versions: hw.map(|(min, max)| HardwareVersions { min, max }),
                }
            })
    }

    proptest! {
        #[test]
        fn prop_header_round_trip(header in arb_header()) {
            let bytes = header.encode();
            prop_assert_eq!(bytes.len(), header.header_length() as usize);
            prop_assert_eq!(Header::decode(&bytes).unwrap(), header);
        }
    }
}
