//! Tag chain walking.
//!
//! Tags start right after the header. Each is a 6-byte record (id, length)
//! followed by `length` bytes of data; the next tag begins where the data
//! ends. The chain must end exactly at the image size.

use std::fmt;

use crate::cursor::ByteReader;
use crate::error::FormatError;
use crate::header::Header;

pub const TAG_HEADER_LENGTH: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagId(pub u16);

impl TagId {
    pub const UPGRADE_IMAGE: TagId = TagId(0x0000);
    pub const ECDSA_SIGNATURE: TagId = TagId(0x0001);
    pub const ECDSA_CERTIFICATE: TagId = TagId(0x0002);
    pub const IMAGE_INTEGRITY_CODE: TagId = TagId(0x0003);
    pub const PICTURE_DATA: TagId = TagId(0x0004);
    /// Manufacturer-specific range starts here.
    pub const MANUFACTURER_BASE: TagId = TagId(0xF000);
    /// SHA-256 over every byte that precedes this tag's record.
    pub const SHA256_DIGEST: TagId = TagId(0xF100);

    pub fn is_manufacturer_specific(self) -> bool {
        self.0 >= Self::MANUFACTURER_BASE.0
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            TagId::UPGRADE_IMAGE => "upgrade-image",
            TagId::ECDSA_SIGNATURE => "ecdsa-signature",
            TagId::ECDSA_CERTIFICATE => "ecdsa-certificate",
            TagId::IMAGE_INTEGRITY_CODE => "integrity-code",
            TagId::PICTURE_DATA => "picture-data",
            TagId::SHA256_DIGEST => "sha256-digest",
            _ => return write!(f, "tag-0x{:04X}", self.0),
        };
        f.write_str(name)
    }
}

/// Location of one tag inside an image. `offset` is where the data starts,
/// after the 6-byte record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagInfo {
    pub id: TagId,
    pub offset: u32,
    pub length: u32,
}

impl TagInfo {
    /// Offset of the tag's record header.
    pub fn record_offset(&self) -> u32 {
        self.offset - TAG_HEADER_LENGTH
    }

    pub fn end(&self) -> u32 {
        self.offset + self.length
    }
}

/// Random-access byte source an image can be read from.
pub trait TagSource {
    /// Fill `buf` from `offset`, returning how many bytes were available.
    /// Short reads at the end are not errors.
    fn read_at(&self, offset: u32, buf: &mut [u8]) -> Result<usize, FormatError>;
}

impl TagSource for [u8] {
    fn read_at(&self, offset: u32, buf: &mut [u8]) -> Result<usize, FormatError> {
        let start = (offset as usize).min(self.len());
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

impl TagSource for Vec<u8> {
    fn read_at(&self, offset: u32, buf: &mut [u8]) -> Result<usize, FormatError> {
        self.as_slice().read_at(offset, buf)
    }
}

/// Lazy walk over the tags of one image. Each step issues a single 6-byte
/// read; tag data itself is skipped. Start over by building a new chain.
pub struct TagChain<'a, S: TagSource + ?Sized> {
    source: &'a S,
    cursor: u64,
    image_size: u64,
    done: bool,
}

impl<'a, S: TagSource + ?Sized> TagChain<'a, S> {
    pub fn new(source: &'a S, header: &Header) -> Self {
        Self {
            source,
            cursor: header.header_length() as u64,
            image_size: header.image_size as u64,
            done: false,
        }
    }

    fn fail(&mut self) -> Option<Result<TagInfo, FormatError>> {
        self.done = true;
        Some(Err(FormatError::TruncatedTagChain {
            offset: self.cursor as u32,
            image_size: self.image_size as u32,
        }))
    }
}

impl<'a, S: TagSource + ?Sized> Iterator for TagChain<'a, S> {
    type Item = Result<TagInfo, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cursor == self.image_size {
            self.done = true;
            return None;
        }
        if self.cursor + TAG_HEADER_LENGTH as u64 > self.image_size {
            return self.fail();
        }

        let mut record = [0u8; TAG_HEADER_LENGTH as usize];
        let n = match self.source.read_at(self.cursor as u32, &mut record) {
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if n < record.len() {
            return self.fail();
        }

        let mut r = ByteReader::new(&record);
        let (id, length) = match (r.u16_le(), r.u32_le()) {
            (Ok(id), Ok(length)) => (id, length),
            _ => return self.fail(),
        };

        let data_offset = self.cursor + TAG_HEADER_LENGTH as u64;
        let end = data_offset + length as u64;
        if end > self.image_size {
            return self.fail();
        }
        self.cursor = end;

        Some(Ok(TagInfo {
            id: TagId(id),
            offset: data_offset as u32,
            length,
        }))
    }
}

/// First tag with the given id.
pub fn find_tag<S: TagSource + ?Sized>(
    source: &S,
    header: &Header,
    id: TagId,
) -> Result<TagInfo, FormatError> {
    for tag in TagChain::new(source, header) {
        let tag = tag?;
        if tag.id == id {
            return Ok(tag);
        }
    }
    Err(FormatError::TagNotFound(id.0))
}

/// Every tag with the given id, in chain order.
pub fn find_all_tags<S: TagSource + ?Sized>(
    source: &S,
    header: &Header,
    id: TagId,
) -> Result<Vec<TagInfo>, FormatError> {
    TagChain::new(source, header)
        .filter(|t| t.as_ref().map_or(true, |t| t.id == id))
        .collect()
}

/// Read a tag's data in full.
pub fn read_tag_data<S: TagSource + ?Sized>(
    source: &S,
    tag: &TagInfo,
) -> Result<Vec<u8>, FormatError> {
    let mut data = vec![0u8; tag.length as usize];
    let n = source.read_at(tag.offset, &mut data)?;
    if n < data.len() {
        return Err(FormatError::OffsetOutOfRange {
            offset: tag.offset,
            length: tag.length,
            limit: tag.offset + n as u32,
        });
    }
    Ok(data)
}
