//! Composes a header and tag chain into a complete OTA image.

use crate::cursor::ByteWriter;
use crate::header::Header;
use crate::tag::{TagId, TAG_HEADER_LENGTH};

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    header: Header,
    tags: Vec<(TagId, Vec<u8>)>,
}

impl ImageBuilder {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            tags: Vec::new(),
        }
    }

    pub fn tag(mut self, id: TagId, data: impl Into<Vec<u8>>) -> Self {
        self.tags.push((id, data.into()));
        self
    }

    /// Size the finished image will have.
    pub fn image_size(&self) -> u32 {
        let tags: u32 = self
            .tags
            .iter()
            .map(|(_, data)| TAG_HEADER_LENGTH + data.len() as u32)
            .sum();
        self.header.header_length() as u32 + tags
    }

    pub fn build(self) -> Vec<u8> {
        self.build_with_header().1
    }

    /// The image bytes plus the header with `image_size` filled in.
    pub fn build_with_header(self) -> (Header, Vec<u8>) {
        let mut header = self.header.clone();
        header.image_size = self.image_size();

        let mut w = ByteWriter::with_capacity(header.image_size as usize);
        w.bytes(&header.encode());
        for (id, data) in &self.tags {
            w.u16_le(id.0).u32_le(data.len() as u32).bytes(data);
        }
        (header, w.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_size_fixed_up() {
        let (header, bytes) = ImageBuilder::new(Header::new(1, 2, 3))
            .tag(TagId::UPGRADE_IMAGE, vec![0u8; 10])
            .build_with_header();
        assert_eq!(header.image_size, 56 + 16);
        assert_eq!(bytes.len(), header.image_size as usize);
        assert_eq!(Header::decode(&bytes).unwrap(), header);
    }
}
