// Page-erase store - single image on flash that must be erased a page at a time
//
// Flash layout:
//   start_address .. +region_size      image region, first `reserved_prefix`
//                                      bytes belong to the bootloader
//   bytemask_address .. +pages         one byte per region page, 0xFF until the
//                                      page is fully written, then 0x00
//
// Erase is slow, so it runs as a background task polled from `poll_erase`.
// Writes that need an unerased page start the erase and fail with
// `EraseInProgress`; the caller retries on a later tick.

use std::ops::RangeInclusive;

use ota_core::header::MAX_HEADER_LENGTH;
use ota_core::{Header, ImageId};
use serde::{Deserialize, Serialize};

use super::{
    clamp_read, header_matches, sniff_header, DownloadState, FlashDevice, ImageCatalog, RamFlash,
    StorageError, StorageInfo, TempImageStatus,
};

const MARKED: u8 = 0x00;
const UNMARKED: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEraseLayout {
    pub start_address: u32,
    pub region_size: u32,
    pub reserved_prefix: u32,
    pub bytemask_address: u32,
}

/// The single outstanding erase, if any. Pages are absolute device pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseTask {
    Idle,
    ErasingPage(u32),
}

pub struct PageEraseStore<F: FlashDevice = RamFlash> {
    device: F,
    layout: PageEraseLayout,
    page_size: u32,
    /// Pages in the image region.
    pages: u32,
    erase: EraseTask,
    /// Region-relative; every page below it is erased or already written.
    next_erase_page: u32,
    /// Region pages whose bytemask entry is cleared.
    marked_pages: u32,
    /// Next bytemask page to erase after an invalidate.
    stale_bytemask: Option<u32>,
    /// Bootloader bytes sharing the page being erased, put back afterwards.
    saved_prefix: Option<(u32, Vec<u8>)>,
    header: Option<Header>,
    download: DownloadState,
}

impl PageEraseLayout {
    /// Check the layout against a device. Returns the page count of the
    /// image region.
    pub fn validate(&self, capacity: u32, page_size: u32) -> Result<u32, StorageError> {
        let invalid = |msg: String| Err(StorageError::InvalidLayout(msg));
        if page_size == 0 {
            return invalid("page size is zero".into());
        }
        if self.start_address % page_size != 0 || self.bytemask_address % page_size != 0 {
            return invalid(format!("region and bytemask must be {}-byte aligned", page_size));
        }
        if self.region_size == 0 || self.region_size % page_size != 0 {
            return invalid(format!(
                "region size {} is not a multiple of the page size",
                self.region_size
            ));
        }
        if self.reserved_prefix >= self.region_size {
            return invalid("reserved prefix covers the whole region".into());
        }
        let region_end = self.start_address as u64 + self.region_size as u64;
        if region_end > capacity as u64 {
            return invalid(format!("region ends at {} beyond device {}", region_end, capacity));
        }

        let pages = self.region_size / page_size;
        let mask_end = self.bytemask_address as u64 + pages as u64;
        if mask_end > capacity as u64 {
            return invalid(format!("bytemask ends at {} beyond device {}", mask_end, capacity));
        }
        // The bytemask is erased a whole page at a time
        let mask_pages_end = mask_end.div_ceil(page_size as u64) * page_size as u64;
        if (self.bytemask_address as u64) < region_end
            && (self.start_address as u64) < mask_pages_end
        {
            return invalid("bytemask overlaps the image region".into());
        }
        Ok(pages)
    }
}

impl<F: FlashDevice> PageEraseStore<F> {
    /// Open the store and rebuild download progress from the bytemask.
    pub fn open(device: F, layout: PageEraseLayout) -> Result<Self, StorageError> {
        let page_size = device.page_size();
        let pages = layout.validate(device.capacity(), page_size)?;

        let mut mask = vec![0u8; pages as usize];
        device.read(layout.bytemask_address, &mut mask)?;
        let first_unmarked = mask
            .iter()
            .position(|&b| b == UNMARKED)
            .unwrap_or(pages as usize) as u32;

        let mut store = Self {
            device,
            layout,
            page_size,
            pages,
            erase: EraseTask::Idle,
            next_erase_page: first_unmarked,
            marked_pages: first_unmarked,
            stale_bytemask: None,
            saved_prefix: None,
            header: None,
            download: DownloadState::default(),
        };

        let progress = store.pages_end_offset(first_unmarked);
        if progress == 0 {
            log::debug!("Bytemask blank, no download progress");
            return Ok(store);
        }

        match store.read_header(progress) {
            Some(header) if header.image_size <= store.image_capacity() => {
                if progress >= header.image_size {
                    log::info!(
                        "Flash holds complete image {} ({} bytes)",
                        header.image_id(),
                        header.image_size
                    );
                    store.download = DownloadState::complete(&header);
                    store.header = Some(header);
                } else {
                    log::info!(
                        "Resuming partial image {} at offset {} of {}",
                        header.image_id(),
                        progress,
                        header.image_size
                    );
                    store.download.learn_header(&header);
                    store.download.last_written_offset = progress;
                }
            }
            _ => {
                log::warn!(
                    "Bytemask shows {} written pages but no valid header, discarding",
                    first_unmarked
                );
                store.reset_progress();
                store.stale_bytemask = Some(*store.bytemask_pages().start());
            }
        }
        Ok(store)
    }

    pub fn device(&self) -> &F {
        &self.device
    }

    pub fn into_device(self) -> F {
        self.device
    }

    pub fn erase_task(&self) -> EraseTask {
        self.erase
    }

    /// Bytes available to the image itself.
    pub fn image_capacity(&self) -> u32 {
        self.layout.region_size - self.layout.reserved_prefix
    }

    /// Advance the erase task: notice completion, then start any erase the
    /// bytemask still needs.
    pub fn poll_erase(&mut self) -> EraseTask {
        if let EraseTask::ErasingPage(page) = self.erase {
            if self.device.is_busy() {
                return self.erase;
            }
            self.erase = EraseTask::Idle;

            let mask_pages = self.bytemask_pages();
            if mask_pages.contains(&page) {
                if page == *mask_pages.end() {
                    log::info!("Bytemask cleared");
                    self.stale_bytemask = None;
                } else {
                    self.stale_bytemask = Some(page + 1);
                }
            } else if page == self.region_first_page() + self.next_erase_page {
                log::trace!("Page {} erased", page);
                if let Some((address, saved)) = self.saved_prefix.take() {
                    if let Err(e) = self.device.write(address, &saved) {
                        log::error!("Lost {} reserved bytes at {}: {}", saved.len(), address, e);
                    }
                }
                self.next_erase_page += 1;
            }
        }

        if self.erase == EraseTask::Idle {
            if let Some(page) = self.stale_bytemask {
                if let Err(e) = self.start_erase(page) {
                    log::warn!("Could not start bytemask erase: {}", e);
                }
            }
        }
        self.erase
    }

    fn start_erase(&mut self, page: u32) -> Result<(), StorageError> {
        self.device.start_erase(page)?;
        log::debug!("Erasing flash page {}", page);
        self.erase = EraseTask::ErasingPage(page);
        Ok(())
    }

    /// Erase the next region page, keeping any reserved bytes it holds.
    fn erase_next_region_page(&mut self) -> Result<(), StorageError> {
        // Pages wholly inside the reserved prefix are never erased
        while (self.next_erase_page + 1) * self.page_size <= self.layout.reserved_prefix {
            self.next_erase_page += 1;
        }
        let page_start = self.next_erase_page * self.page_size;
        let reserved_end = self.layout.reserved_prefix.min(page_start + self.page_size);
        if reserved_end > page_start {
            let address = self.layout.start_address + page_start;
            let mut saved = vec![0u8; (reserved_end - page_start) as usize];
            self.device.read(address, &mut saved)?;
            self.saved_prefix = Some((address, saved));
        }
        let page = self.region_first_page() + self.next_erase_page;
        if let Err(e) = self.start_erase(page) {
            self.saved_prefix = None;
            return Err(e);
        }
        Ok(())
    }

    fn region_first_page(&self) -> u32 {
        self.layout.start_address / self.page_size
    }

    fn bytemask_pages(&self) -> RangeInclusive<u32> {
        let first = self.layout.bytemask_address / self.page_size;
        let last = (self.layout.bytemask_address + self.pages - 1) / self.page_size;
        first..=last
    }

    fn flash_address(&self, offset: u32) -> u32 {
        self.layout.start_address + self.layout.reserved_prefix + offset
    }

    /// Region page holding image byte `offset`.
    fn region_page(&self, offset: u32) -> u32 {
        (self.layout.reserved_prefix + offset) / self.page_size
    }

    /// Image offset just past the first `count` region pages.
    fn pages_end_offset(&self, count: u32) -> u32 {
        (count * self.page_size)
            .saturating_sub(self.layout.reserved_prefix)
            .min(self.image_capacity())
    }

    fn read_header(&self, available: u32) -> Option<Header> {
        let len = (MAX_HEADER_LENGTH as u32).min(available);
        let mut buf = vec![0u8; len as usize];
        self.device.read(self.flash_address(0), &mut buf).ok()?;
        sniff_header(&buf)
    }

    fn mark_pages_through(&mut self, last_page: u32) -> Result<(), StorageError> {
        while self.marked_pages <= last_page && self.marked_pages < self.pages {
            let address = self.layout.bytemask_address + self.marked_pages;
            self.device.write(address, &[MARKED])?;
            self.marked_pages += 1;
        }
        Ok(())
    }

    fn reset_progress(&mut self) {
        self.marked_pages = 0;
        self.next_erase_page = 0;
        self.header = None;
        self.download = DownloadState::default();
    }

    fn complete_header_for(&self, id: &ImageId) -> Result<&Header, StorageError> {
        match &self.header {
            Some(header) if header.image_id().matches_triple(id) => Ok(header),
            Some(_) => Err(StorageError::ImageNotFound(*id)),
            None => Err(StorageError::NoImage),
        }
    }
}

impl<F: FlashDevice> ImageCatalog for PageEraseStore<F> {
    fn search(
        &self,
        manufacturer_id: u16,
        image_type_id: u16,
        hardware_version: Option<u16>,
    ) -> Option<ImageId> {
        self.header
            .as_ref()
            .filter(|h| header_matches(h, manufacturer_id, image_type_id, hardware_version))
            .map(|h| h.image_id())
    }

    fn header(&self, id: &ImageId) -> Result<Header, StorageError> {
        self.complete_header_for(id).cloned()
    }

    fn read_bytes(
        &self,
        id: &ImageId,
        offset: u32,
        max_length: u32,
    ) -> Result<Vec<u8>, StorageError> {
        let header = self.complete_header_for(id)?;
        let len = clamp_read(header.image_size, offset, max_length);
        let mut buf = vec![0u8; len as usize];
        if len > 0 {
            self.device.read(self.flash_address(offset), &mut buf)?;
        }
        Ok(buf)
    }

    fn write_bytes(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        if self.erase != EraseTask::Idle {
            return Err(StorageError::EraseInProgress);
        }
        if self.header.is_some() {
            if offset != 0 {
                return Err(StorageError::AlignmentRequired { offset, expected: 0 });
            }
            log::info!("New download replaces stored image");
            self.invalidate()?;
        }
        if let Some(page) = self.stale_bytemask {
            self.start_erase(page)?;
            return Err(StorageError::EraseInProgress);
        }

        let length = data.len() as u32;
        let end = offset as u64 + length as u64;
        if end > self.image_capacity() as u64 {
            return Err(StorageError::StorageFull {
                offset,
                length,
                capacity: self.image_capacity(),
            });
        }
        let end = end as u32;
        let last = self.download.last_written_offset;
        if end <= last {
            log::trace!("Bytes {}..{} already persisted", offset, end);
            return Ok(());
        }
        if offset > last {
            return Err(StorageError::AlignmentRequired {
                offset,
                expected: last,
            });
        }

        // Only the part past what is already on flash gets programmed
        let fresh = &data[(last - offset) as usize..];
        if self.region_page(end - 1) >= self.next_erase_page {
            self.erase_next_region_page()?;
            return Err(StorageError::EraseInProgress);
        }

        self.device.write(self.flash_address(last), fresh)?;
        self.download.record_write(last, fresh.len() as u32);

        let written = self.download.last_written_offset;
        while self.marked_pages < self.pages
            && self.pages_end_offset(self.marked_pages + 1) <= written
        {
            self.mark_pages_through(self.marked_pages)?;
        }

        if self.download.total_size.is_none() {
            if let Some(header) = self.read_header(written) {
                log::debug!(
                    "Download of {} ({} bytes) under way",
                    header.image_id(),
                    header.image_size
                );
                self.download.learn_header(&header);
            }
        }
        Ok(())
    }

    fn finish_download(&mut self, final_offset: u32) -> Result<ImageId, StorageError> {
        if self.erase != EraseTask::Idle || self.stale_bytemask.is_some() {
            return Err(StorageError::EraseInProgress);
        }
        let header = self
            .read_header(self.download.last_written_offset)
            .ok_or(StorageError::NoImage)?;
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

        // The last page is usually only partly filled
        self.mark_pages_through(self.region_page(final_offset - 1))?;

        let id = header.image_id();
        log::info!("Flash download complete: {} ({} bytes)", id, final_offset);
        self.download = DownloadState::complete(&header);
        self.header = Some(header);
        Ok(id)
    }

    fn invalidate(&mut self) -> Result<(), StorageError> {
        if self.erase != EraseTask::Idle {
            return Err(StorageError::EraseInProgress);
        }
        // Zeroing the magic works without an erase; the bytemask needs one
        self.device.write(self.flash_address(0), &[0u8; 4])?;
        if self.marked_pages > 0 {
            self.stale_bytemask = Some(*self.bytemask_pages().start());
        }
        self.reset_progress();
        log::info!("Flash image invalidated");
        Ok(())
    }

    fn delete(&mut self, id: &ImageId) -> Result<(), StorageError> {
        self.complete_header_for(id)?;
        self.invalidate()
    }

    fn images(&self) -> Box<dyn Iterator<Item = ImageId> + '_> {
        Box::new(self.header.iter().map(|h| h.image_id()))
    }

    fn download_state(&self) -> DownloadState {
        self.download
    }

    fn temp_image_status(&self) -> TempImageStatus {
        match &self.header {
            Some(header) => TempImageStatus::Complete(header.image_id()),
            None if self.download.last_written_offset > 0 => {
                TempImageStatus::Partial(self.download)
            }
            None => TempImageStatus::Empty,
        }
    }

    fn info(&self) -> StorageInfo {
        StorageInfo {
            backend: "page-erase",
            image_count: self.header.iter().count(),
            capacity: self.image_capacity() as u64,
        }
    }

    fn tick(&mut self) {
        self.poll_erase();
    }
}
