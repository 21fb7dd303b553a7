// Image storage - the catalog of OTA images a node or server holds
//
// Backends:
// 1. SingleSlotStore  - one image in RAM/EEPROM, header cached on open
// 2. PageEraseStore   - flash with slow page erase, resumable via a bytemask
// 3. DirectoryStore   - one file per image, any number of images

pub mod directory;
pub mod flash;
pub mod page_erase;
pub mod single_slot;

pub use directory::{DirectoryStore, ImageHandle};
pub use flash::{FlashDevice, RamFlash};
pub use page_erase::{EraseTask, PageEraseLayout, PageEraseStore};
pub use single_slot::SingleSlotStore;

use ota_core::{FormatError, Header, ImageId, TagChain, TagInfo, TagSource};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid image: {0}")]
    Format(#[from] FormatError),

    #[error("no image stored")]
    NoImage,

    #[error("image {0} not in catalog")]
    ImageNotFound(ImageId),

    #[error("partial image: {present} of {expected} bytes present")]
    PartialFileFound { present: u64, expected: u32 },

    #[error("write of {length} bytes at offset {offset} exceeds capacity {capacity}")]
    StorageFull {
        offset: u32,
        length: u32,
        capacity: u32,
    },

    #[error("write at offset {offset} must start at {expected}")]
    AlignmentRequired { offset: u32, expected: u32 },

    #[error("page erase in progress")]
    EraseInProgress,

    #[error("access of {length} bytes at address {offset} outside device")]
    OffsetOutOfRange { offset: u32, length: u32 },

    #[error("header says image is {expected} bytes, download ended at {actual}")]
    ImageSizeMismatch { expected: u32, actual: u32 },

    #[error("download incomplete: {written} of {expected} bytes written")]
    IncompleteDownload { written: u32, expected: u32 },

    #[error("invalid storage layout: {0}")]
    InvalidLayout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download state: {0}")]
    State(#[from] serde_json::Error),
}

impl StorageError {
    /// Errors that clear up on their own; retry on a later tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::EraseInProgress)
    }
}

/// Progress of the image currently being downloaded into a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadState {
    pub last_written_offset: u32,
    pub total_size: Option<u32>,
    pub image_id: Option<ImageId>,
}

impl DownloadState {
    pub fn is_active(&self) -> bool {
        self.last_written_offset > 0 && !self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.total_size, Some(total) if self.last_written_offset >= total)
    }

    /// Account for a persisted write. Only contiguous writes advance the
    /// offset, and it never moves backwards.
    pub fn record_write(&mut self, offset: u32, length: u32) {
        if offset <= self.last_written_offset {
            self.last_written_offset = self.last_written_offset.max(offset.saturating_add(length));
        }
    }

    /// Pick up size and id from the header once enough bytes are in.
    pub fn learn_header(&mut self, header: &Header) {
        self.total_size = Some(header.image_size);
        self.image_id = Some(header.image_id());
    }

    pub fn complete(header: &Header) -> Self {
        Self {
            last_written_offset: header.image_size,
            total_size: Some(header.image_size),
            image_id: Some(header.image_id()),
        }
    }

    pub fn progress_percent(&self) -> u8 {
        match self.total_size {
            Some(0) | None => 0,
            Some(total) => {
                ((self.last_written_offset.min(total) as u64 * 100) / total as u64) as u8
            }
        }
    }
}

/// What a backend holds in its download area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempImageStatus {
    Empty,
    /// Valid header but fewer bytes than the header announces; resumable.
    Partial(DownloadState),
    Complete(ImageId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    pub backend: &'static str,
    pub image_count: usize,
    pub capacity: u64,
}

/// Common contract of every storage backend.
pub trait ImageCatalog {
    /// Best image for the given product, optionally filtered by hardware
    /// version. Returns `None` when nothing matches.
    fn search(
        &self,
        manufacturer_id: u16,
        image_type_id: u16,
        hardware_version: Option<u16>,
    ) -> Option<ImageId>;

    /// Header of a stored image, matched on manufacturer, type and version.
    fn header(&self, id: &ImageId) -> Result<Header, StorageError>;

    /// Up to `max_length` bytes from `offset`, never past the image size.
    /// Reading at or beyond the end yields an empty buffer.
    fn read_bytes(&self, id: &ImageId, offset: u32, max_length: u32)
        -> Result<Vec<u8>, StorageError>;

    /// Persist downloaded bytes of the in-progress image.
    fn write_bytes(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Seal the in-progress image once `final_offset` bytes are in.
    fn finish_download(&mut self, final_offset: u32) -> Result<ImageId, StorageError>;

    /// Wipe the in-progress image and reset the download state.
    fn invalidate(&mut self) -> Result<(), StorageError>;

    /// Remove one stored image.
    fn delete(&mut self, id: &ImageId) -> Result<(), StorageError>;

    /// Every complete image, in a stable order. Call again to restart.
    fn images(&self) -> Box<dyn Iterator<Item = ImageId> + '_>;

    fn download_state(&self) -> DownloadState;

    fn temp_image_status(&self) -> TempImageStatus;

    fn info(&self) -> StorageInfo;

    /// Advance background work. Only backends with asynchronous erase do
    /// anything here.
    fn tick(&mut self) {}

    fn is_full_image_present(&self) -> bool {
        self.images().next().is_some()
    }

    fn contains(&self, id: &ImageId) -> bool {
        self.images().any(|stored| stored.matches_triple(id))
    }

    fn image_size(&self, id: &ImageId) -> Option<u32> {
        self.header(id).ok().map(|h| h.image_size)
    }
}

/// The configured backend is only known at runtime.
impl<T: ImageCatalog + ?Sized> ImageCatalog for Box<T> {
    fn search(
        &self,
        manufacturer_id: u16,
        image_type_id: u16,
        hardware_version: Option<u16>,
    ) -> Option<ImageId> {
        (**self).search(manufacturer_id, image_type_id, hardware_version)
    }

    fn header(&self, id: &ImageId) -> Result<Header, StorageError> {
        (**self).header(id)
    }

    fn read_bytes(
        &self,
        id: &ImageId,
        offset: u32,
        max_length: u32,
    ) -> Result<Vec<u8>, StorageError> {
        (**self).read_bytes(id, offset, max_length)
    }

    fn write_bytes(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        (**self).write_bytes(offset, data)
    }

    fn finish_download(&mut self, final_offset: u32) -> Result<ImageId, StorageError> {
        (**self).finish_download(final_offset)
    }

    fn invalidate(&mut self) -> Result<(), StorageError> {
        (**self).invalidate()
    }

    fn delete(&mut self, id: &ImageId) -> Result<(), StorageError> {
        (**self).delete(id)
    }

    fn images(&self) -> Box<dyn Iterator<Item = ImageId> + '_> {
        (**self).images()
    }

    fn download_state(&self) -> DownloadState {
        (**self).download_state()
    }

    fn temp_image_status(&self) -> TempImageStatus {
        (**self).temp_image_status()
    }

    fn info(&self) -> StorageInfo {
        (**self).info()
    }

    fn tick(&mut self) {
        (**self).tick()
    }
}

/// Search predicate shared by the backends.
pub(crate) fn header_matches(
    header: &Header,
    manufacturer_id: u16,
    image_type_id: u16,
    hardware_version: Option<u16>,
) -> bool {
    header.manufacturer_id == manufacturer_id
        && header.image_type_id == image_type_id
        && header.supports_hardware(hardware_version)
}

/// Decode a header from the first bytes of an image, if enough are there.
pub(crate) fn sniff_header(bytes: &[u8]) -> Option<Header> {
    Header::decode(bytes).ok()
}

/// Length of a read starting at `offset`, clamped to the image end.
pub(crate) fn clamp_read(image_size: u32, offset: u32, max_length: u32) -> u32 {
    if offset >= image_size {
        0
    } else {
        max_length.min(image_size - offset)
    }
}

/// Lets tag chains be walked directly against a catalog.
pub struct CatalogTagSource<'a, C: ImageCatalog + ?Sized> {
    catalog: &'a C,
    id: ImageId,
}

impl<'a, C: ImageCatalog + ?Sized> CatalogTagSource<'a, C> {
    pub fn new(catalog: &'a C, id: ImageId) -> Self {
        Self { catalog, id }
    }
}

impl<'a, C: ImageCatalog + ?Sized> TagSource for CatalogTagSource<'a, C> {
    fn read_at(&self, offset: u32, buf: &mut [u8]) -> Result<usize, FormatError> {
        match self.catalog.read_bytes(&self.id, offset, buf.len() as u32) {
            Ok(data) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Err(e) => {
                log::warn!("Tag read of {} at {} failed: {}", self.id, offset, e);
                Err(FormatError::SourceRead {
                    offset,
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// All tags of a stored image.
pub fn image_tags<C: ImageCatalog + ?Sized>(
    catalog: &C,
    id: &ImageId,
) -> Result<Vec<TagInfo>, StorageError> {
    let header = catalog.header(id)?;
    let source = CatalogTagSource::new(catalog, *id);
    let tags = TagChain::new(&source, &header).collect::<Result<Vec<_>, _>>()?;
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_state_monotonic() {
        let mut state = DownloadState::default();
        state.record_write(0, 64);
        state.record_write(64, 64);
        assert_eq!(state.last_written_offset, 128);
        // Retransmission of an old block
        state.record_write(0, 64);
        assert_eq!(state.last_written_offset, 128);
        // Gap: does not advance
        state.record_write(512, 64);
        assert_eq!(state.last_written_offset, 128);
        // Overlapping tail
        state.record_write(100, 64);
        assert_eq!(state.last_written_offset, 164);
    }

    #[test]
    fn test_download_state_complete() {
        let mut state = DownloadState {
            total_size: Some(100),
            ..Default::default()
        };
        assert!(!state.is_complete());
        state.record_write(0, 60);
        assert!(state.is_active());
        assert_eq!(state.progress_percent(), 60);
        state.record_write(60, 40);
        assert!(state.is_complete());
        assert_eq!(state.progress_percent(), 100);
    }

    proptest::proptest! {
        #[test]
        fn prop_download_offset_never_regresses(
            writes in proptest::collection::vec((0u32..4096, 1u32..256), 0..64)
        ) {
            let mut state = DownloadState::default();
            for (offset, length) in writes {
                let before = state.last_written_offset;
                state.record_write(offset, length);
                proptest::prop_assert!(state.last_written_offset >= before);
                if offset > before {
                    proptest::prop_assert_eq!(state.last_written_offset, before);
                }
            }
        }
    }

    #[test]
    fn test_tag_source_keeps_catalog_error() {
        let store = SingleSlotStore::open(RamFlash::eeprom(64));
        let source = CatalogTagSource::new(&store, ImageId::new(0x1002, 1, 1));
        let mut buf = [0u8; 6];
        match source.read_at(56, &mut buf) {
            Err(FormatError::SourceRead { offset, reason }) => {
                assert_eq!(offset, 56);
                assert_eq!(reason, StorageError::NoImage.to_string());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_clamp_read() {
        assert_eq!(clamp_read(100, 0, 64), 64);
        assert_eq!(clamp_read(100, 90, 64), 10);
        assert_eq!(clamp_read(100, 100, 64), 0);
        assert_eq!(clamp_read(100, 500, 64), 0);
    }
}
