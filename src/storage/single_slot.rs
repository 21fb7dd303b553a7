// Single-slot store - exactly one full or partial image in RAM/EEPROM

use ota_core::header::MAX_HEADER_LENGTH;
use ota_core::{Header, ImageId};

use super::{
    clamp_read, header_matches, sniff_header, DownloadState, FlashDevice, ImageCatalog, RamFlash,
    StorageError, StorageInfo, TempImageStatus,
};

pub struct SingleSlotStore<F: FlashDevice = RamFlash> {
    device: F,
    cached: Option<Header>,
    download: DownloadState,
}

impl<F: FlashDevice> SingleSlotStore<F> {
    /// Open the slot and cache the stored image if its header is valid.
    pub fn open(device: F) -> Self {
        let mut store = Self {
            device,
            cached: None,
            download: DownloadState::default(),
        };
        match store.read_header() {
            Ok(header) if header.image_size <= store.device.capacity() => {
                log::info!(
                    "Slot holds image {} ({} bytes)",
                    header.image_id(),
                    header.image_size
                );
                store.download = DownloadState::complete(&header);
                store.cached = Some(header);
            }
            Ok(header) => {
                log::warn!(
                    "Slot header claims {} bytes, slot is only {}",
                    header.image_size,
                    store.device.capacity()
                );
            }
            Err(e) => log::debug!("No valid image in slot: {}", e),
        }
        store
    }

    pub fn device(&self) -> &F {
        &self.device
    }

    pub fn into_device(self) -> F {
        self.device
    }

    fn read_header(&self) -> Result<Header, StorageError> {
        let len = (MAX_HEADER_LENGTH as u32).min(self.device.capacity());
        let mut buf = vec![0u8; len as usize];
        self.device.read(0, &mut buf)?;
        Ok(Header::decode(&buf)?)
    }

    fn cached_for(&self, id: &ImageId) -> Result<&Header, StorageError> {
        match &self.cached {
            Some(header) if header.image_id().matches_triple(id) => Ok(header),
            Some(_) => Err(StorageError::ImageNotFound(*id)),
            None => Err(StorageError::NoImage),
        }
    }
}

impl<F: FlashDevice> ImageCatalog for SingleSlotStore<F> {
    fn search(
        &self,
        manufacturer_id: u16,
        image_type_id: u16,
        hardware_version: Option<u16>,
    ) -> Option<ImageId> {
        self.cached
            .as_ref()
            .filter(|h| header_matches(h, manufacturer_id, image_type_id, hardware_version))
            .map(|h| h.image_id())
    }

    fn header(&self, id: &ImageId) -> Result<Header, StorageError> {
        self.cached_for(id).cloned()
    }

    fn read_bytes(
        &self,
        id: &ImageId,
        offset: u32,
        max_length: u32,
    ) -> Result<Vec<u8>, StorageError> {
        let header = self.cached_for(id)?;
        let len = clamp_read(header.image_size, offset, max_length);
        let mut buf = vec![0u8; len as usize];
        if len > 0 {
            self.device.read(offset, &mut buf)?;
        }
        Ok(buf)
    }

    fn write_bytes(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let capacity = self.device.capacity();
        if offset as u64 + data.len() as u64 > capacity as u64 {
            return Err(StorageError::StorageFull {
                offset,
                length: data.len() as u32,
                capacity,
            });
        }

        // Any write starts replacing whatever the slot held
        if let Some(old) = self.cached.take() {
            log::info!("Overwriting stored image {}", old.image_id());
            self.download = DownloadState::default();
        }

        self.device.write(offset, data)?;
        self.download.record_write(offset, data.len() as u32);

        if self.download.total_size.is_none() {
            let len = (self.download.last_written_offset as usize).min(MAX_HEADER_LENGTH);
            let mut buf = vec![0u8; len];
            self.device.read(0, &mut buf)?;
            if let Some(header) = sniff_header(&buf) {
                log::debug!("Download of {} ({} bytes) under way", header.image_id(), header.image_size);
                self.download.learn_header(&header);
            }
        }
        Ok(())
    }

    fn finish_download(&mut self, final_offset: u32) -> Result<ImageId, StorageError> {
        let header = self.read_header()?;
        if header.image_size != final_offset {
            return Err(StorageError::ImageSizeMismatch {
                expected: header.image_size,
                actual: final_offset,
            });
        }
        if self.download.last_written_offset < final_offset {
            return Err(StorageError::IncompleteDownload {
                written: self.download.last_written_offset,
                expected: final_offset,
            });
        }
        let id = header.image_id();
        log::info!("Slot download complete: {} ({} bytes)", id, final_offset);
        self.download = DownloadState::complete(&header);
        self.cached = Some(header);
        Ok(id)
    }

    fn invalidate(&mut self) -> Result<(), StorageError> {
        // A zeroed magic number is enough for the next open to see no image
        self.device.write(0, &[0u8; 4])?;
        self.cached = None;
        self.download = DownloadState::default();
        log::info!("Slot invalidated");
        Ok(())
    }

    fn delete(&mut self, id: &ImageId) -> Result<(), StorageError> {
        self.cached_for(id)?;
        self.invalidate()
    }

    fn images(&self) -> Box<dyn Iterator<Item = ImageId> + '_> {
        Box::new(self.cached.iter().map(|h| h.image_id()))
    }

    fn download_state(&self) -> DownloadState {
        self.download
    }

    fn temp_image_status(&self) -> TempImageStatus {
        match &self.cached {
            Some(header) => TempImageStatus::Complete(header.image_id()),
            None if self.download.last_written_offset > 0 => {
                TempImageStatus::Partial(self.download)
            }
            None => TempImageStatus::Empty,
        }
    }

    fn info(&self) -> StorageInfo {
        StorageInfo {
            backend: "single-slot",
            image_count: self.cached.iter().count(),
            capacity: self.device.capacity() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ota_core::header::HardwareVersions;
    use ota_core::{ImageBuilder, TagId};

    fn image(version: u32) -> Vec<u8> {
        let mut header = Header::new(0x1002, 0x0007, version);
        header.hardware_versions = Some(HardwareVersions { min: 2, max: 5 });
        ImageBuilder::new(header)
            .tag(TagId::UPGRADE_IMAGE, (0..200u32).map(|i| i as u8).collect::<Vec<_>>())
            .build()
    }

    fn loaded(version: u32) -> SingleSlotStore {
        let mut flash = RamFlash::eeprom(1024);
        flash.write(0, &image(version)).unwrap();
        SingleSlotStore::open(flash)
    }

    #[test]
    fn test_open_caches_valid_image() {
        let store = loaded(3);
        let id = store.search(0x1002, 0x0007, None).unwrap();
        assert_eq!(id.firmware_version, 3);
        assert!(store.is_full_image_present());
        assert_eq!(store.images().count(), 1);
        assert!(store.download_state().is_complete());
    }

    #[test]
    fn test_search_hardware_filter() {
        let store = loaded(3);
        assert!(store.search(0x1002, 0x0007, Some(3)).is_some());
        assert!(store.search(0x1002, 0x0007, Some(7)).is_none());
        assert!(store.search(0x1002, 0x0008, None).is_none());
    }

    #[test]
    fn test_read_clamped_to_image_size() {
        let store = loaded(3);
        let id = store.search(0x1002, 0x0007, None).unwrap();
        let size = store.image_size(&id).unwrap();
        assert_eq!(store.read_bytes(&id, 0, 64).unwrap().len(), 64);
        assert_eq!(store.read_bytes(&id, size - 10, 64).unwrap().len(), 10);
        assert!(store.read_bytes(&id, size, 64).unwrap().is_empty());
    }

    #[test]
    fn test_invalidate_then_search() {
        let mut store = loaded(3);
        store.invalidate().unwrap();
        assert!(store.search(0x1002, 0x0007, None).is_none());
        assert!(store.search(0xFFFF, 0xFFFF, None).is_none());

        let reopened = SingleSlotStore::open(store.into_device());
        assert!(reopened.search(0x1002, 0x0007, None).is_none());
        assert_eq!(reopened.temp_image_status(), TempImageStatus::Empty);
    }

    #[test]
    fn test_download_overwrites_cache() {
        let mut store = loaded(3);
        let new_image = image(4);
        for (i, chunk) in new_image.chunks(50).enumerate() {
            store.write_bytes((i * 50) as u32, chunk).unwrap();
            assert!(store.search(0x1002, 0x0007, None).is_none());
        }
        assert_eq!(store.download_state().total_size, Some(new_image.len() as u32));
        let id = store.finish_download(new_image.len() as u32).unwrap();
        assert_eq!(id.firmware_version, 4);
        assert_eq!(store.search(0x1002, 0x0007, None), Some(id));
    }

    #[test]
    fn test_finish_rejects_short_download() {
        let mut store = SingleSlotStore::open(RamFlash::eeprom(1024));
        let img = image(9);
        store.write_bytes(0, &img[..100]).unwrap();
        assert!(matches!(
            store.temp_image_status(),
            TempImageStatus::Partial(DownloadState { last_written_offset: 100, .. })
        ));
        assert!(matches!(
            store.finish_download(img.len() as u32),
            Err(StorageError::IncompleteDownload { written: 100, .. })
        ));
        assert!(matches!(
            store.finish_download(100),
            Err(StorageError::ImageSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_write_past_capacity() {
        let mut store = SingleSlotStore::open(RamFlash::eeprom(128));
        assert!(matches!(
            store.write_bytes(100, &[0u8; 64]),
            Err(StorageError::StorageFull { capacity: 128, .. })
        ));
    }
}
