//! OTA Core - Image format logic for mesh firmware distribution
//!
//! This crate contains the binary OTA image format (header, tag chain and
//! image identifiers). It performs no I/O and can be tested on the host
//! platform without any storage backend.

pub mod builder;
pub mod cursor;
pub mod error;
pub mod header;
pub mod image_id;
pub mod tag;

pub use builder::ImageBuilder;
pub use cursor::{ByteReader, ByteWriter};
pub use error::FormatError;
pub use header::{
    FieldControl, HardwareVersions, Header, HeaderVersion, UpgradeDestination, MAX_HEADER_LENGTH,
};
pub use image_id::{Eui64, ImageId};
pub use tag::{find_all_tags, find_tag, read_tag_data, TagChain, TagId, TagInfo, TagSource};
