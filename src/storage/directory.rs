// Directory store - one `.ota` file per image plus a resumable download area
//
// Layout inside the directory:
//   <mfg>-<type>-<version>.ota   sealed images
//   download.partial             image currently being downloaded
//   download.json                its DownloadState

use std::cell::OnceCell;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ota_core::header::MAX_HEADER_LENGTH;
use ota_core::{Header, ImageId};

use super::{
    clamp_read, header_matches, sniff_header, DownloadState, ImageCatalog, StorageError,
    StorageInfo, TempImageStatus,
};

const PARTIAL_FILE: &str = "download.partial";
const STATE_FILE: &str = "download.json";
const IMAGE_EXTENSION: &str = "ota";

/// Stable reference to a catalog entry. Stays valid until that entry is
/// removed; other removals do not shift it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(usize);

struct ImageSlot {
    path: PathBuf,
    file_len: u64,
    /// Parsed on first use. `None` once parsed means the file is not a
    /// usable image.
    header: OnceCell<Option<Header>>,
}

impl ImageSlot {
    fn header(&self) -> Option<&Header> {
        self.header
            .get_or_init(|| load_header(&self.path, self.file_len))
            .as_ref()
    }
}

pub struct DirectoryStore {
    dir: PathBuf,
    max_image_size: u32,
    slots: Vec<Option<ImageSlot>>,
    download: DownloadState,
}

fn read_prefix(path: &Path, len: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len.min(MAX_HEADER_LENGTH as u64) as usize];
    File::open(path)?.read_exact(&mut buf)?;
    Ok(buf)
}

fn load_header(path: &Path, file_len: u64) -> Option<Header> {
    let header = match read_prefix(path, file_len) {
        Ok(buf) => match Header::decode(&buf) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("Skipping {}: {}", path.display(), e);
                return None;
            }
        },
        Err(e) => {
            log::warn!("Cannot read {}: {}", path.display(), e);
            return None;
        }
    };
    if header.image_size as u64 != file_len {
        log::warn!(
            "Skipping {}: header says {} bytes, file has {}",
            path.display(),
            header.image_size,
            file_len
        );
        return None;
    }
    Some(header)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl DirectoryStore {
    /// Open (creating if needed) a store directory. Image headers are only
    /// parsed when first needed.
    pub fn open(dir: impl Into<PathBuf>, max_image_size: u32) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == OsStr::new(IMAGE_EXTENSION)) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut slots = Vec::with_capacity(paths.len());
        for path in paths {
            let file_len = fs::metadata(&path)?.len();
            slots.push(Some(ImageSlot {
                path,
                file_len,
                header: OnceCell::new(),
            }));
        }
        log::info!("Image directory {}: {} files", dir.display(), slots.len());

        let mut store = Self {
            dir,
            max_image_size,
            slots,
            download: DownloadState::default(),
        };
        store.download = store.load_download_state();
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn partial_path(&self) -> PathBuf {
        self.dir.join(PARTIAL_FILE)
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn load_download_state(&self) -> DownloadState {
        let partial_len = match fs::metadata(self.partial_path()) {
            Ok(meta) => meta.len(),
            Err(_) => return DownloadState::default(),
        };
        let mut state = match fs::read(self.state_path())
            .map_err(StorageError::from)
            .and_then(|raw| Ok(serde_json::from_slice::<DownloadState>(&raw)?))
        {
            Ok(state) => state,
            Err(e) => {
                log::warn!("Download state unreadable ({}), starting over", e);
                return DownloadState::default();
            }
        };
        // Never trust the state file beyond what actually reached disk
        if state.last_written_offset as u64 > partial_len {
            log::warn!(
                "Download state claims {} bytes, partial file has {}",
                state.last_written_offset,
                partial_len
            );
            state.last_written_offset = partial_len as u32;
        }
        log::info!(
            "Resuming download at offset {} ({}% done)",
            state.last_written_offset,
            state.progress_percent()
        );
        state
    }

    fn save_download_state(&self) -> Result<(), StorageError> {
        let json = serde_json::to_vec(&self.download)?;
        fs::write(self.state_path(), json)?;
        Ok(())
    }

    fn insert_slot(&mut self, slot: ImageSlot) -> ImageHandle {
        match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(slot);
                ImageHandle(index)
            }
            None => {
                self.slots.push(Some(slot));
                ImageHandle(self.slots.len() - 1)
            }
        }
    }

    /// Register an image file. The file is validated immediately, unlike
    /// the ones found by `open`.
    pub fn add_file(&mut self, path: impl Into<PathBuf>) -> Result<ImageHandle, StorageError> {
        let path = path.into();
        let file_len = fs::metadata(&path)?.len();
        let header = Header::decode(&read_prefix(&path, file_len)?)?;
        if file_len < header.image_size as u64 {
            return Err(StorageError::PartialFileFound {
                present: file_len,
                expected: header.image_size,
            });
        }
        if file_len > header.image_size as u64 {
            return Err(StorageError::ImageSizeMismatch {
                expected: header.image_size,
                actual: file_len.min(u32::MAX as u64) as u32,
            });
        }

        log::info!("Added {} from {}", header.image_id(), path.display());
        Ok(self.insert_slot(ImageSlot {
            path,
            file_len,
            header: OnceCell::from(Some(header)),
        }))
    }

    /// Drop an entry from the catalog, leaving its file alone. Returns the
    /// file's path.
    pub fn remove(&mut self, handle: ImageHandle) -> Option<PathBuf> {
        self.slots
            .get_mut(handle.0)
            .and_then(Option::take)
            .map(|slot| slot.path)
    }

    pub fn handle_of(&self, id: &ImageId) -> Option<ImageHandle> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            let header = slot.as_ref()?.header()?;
            header
                .image_id()
                .matches_triple(id)
                .then_some(ImageHandle(index))
        })
    }

    pub fn header_of(&self, handle: ImageHandle) -> Option<&Header> {
        self.slots.get(handle.0)?.as_ref()?.header()
    }

    pub fn path_of(&self, handle: ImageHandle) -> Option<&Path> {
        self.slots
            .get(handle.0)?
            .as_ref()
            .map(|slot| slot.path.as_path())
    }

    fn slot_for(&self, id: &ImageId) -> Result<(&ImageSlot, &Header), StorageError> {
        self.slots
            .iter()
            .flatten()
            .find_map(|slot| {
                let header = slot.header()?;
                header.image_id().matches_triple(id).then_some((slot, header))
            })
            .ok_or(StorageError::ImageNotFound(*id))
    }

    fn image_file_name(id: &ImageId) -> String {
        format!(
            "{:04x}-{:04x}-{:08x}.{}",
            id.manufacturer_id, id.image_type_id, id.firmware_version, IMAGE_EXTENSION
        )
    }

    fn reset_download(&mut self) -> Result<(), StorageError> {
        remove_if_present(&self.partial_path())?;
        remove_if_present(&self.state_path())?;
        self.download = DownloadState::default();
        Ok(())
    }
}

impl ImageCatalog for DirectoryStore {
    fn search(
        &self,
        manufacturer_id: u16,
        image_type_id: u16,
        hardware_version: Option<u16>,
    ) -> Option<ImageId> {
        self.slots
            .iter()
            .flatten()
            .filter_map(ImageSlot::header)
            .filter(|h| header_matches(h, manufacturer_id, image_type_id, hardware_version))
            .max_by_key(|h| h.firmware_version)
            .map(Header::image_id)
    }

    fn header(&self, id: &ImageId) -> Result<Header, StorageError> {
        self.slot_for(id).map(|(_, header)| header.clone())
    }

    fn read_bytes(
        &self,
        id: &ImageId,
        offset: u32,
        max_length: u32,
    ) -> Result<Vec<u8>, StorageError> {
        let (slot, header) = self.slot_for(id)?;
        let len = clamp_read(header.image_size, offset, max_length);
        let mut buf = vec![0u8; len as usize];
        if len > 0 {
            let mut file = File::open(&slot.path)?;
            file.seek(SeekFrom::Start(offset as u64))?;
            file.read_exact(&mut buf)?;
        }
        Ok(buf)
    }

    fn write_bytes(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        if self.download.is_complete() {
            if offset != 0 {
                return Err(StorageError::AlignmentRequired { offset, expected: 0 });
            }
            self.download = DownloadState::default();
        }

        let length = data.len() as u32;
        let end = offset as u64 + length as u64;
        if end > self.max_image_size as u64 {
            return Err(StorageError::StorageFull {
                offset,
                length,
                capacity: self.max_image_size,
            });
        }
        let end = end as u32;
        if let Some(total) = self.download.total_size {
            if end > total {
                return Err(StorageError::StorageFull {
                    offset,
                    length,
                    capacity: total,
                });
            }
        }
        let last = self.download.last_written_offset;
        if end <= last && last > 0 {
            return Ok(());
        }
        if offset > last {
            return Err(StorageError::AlignmentRequired {
                offset,
                expected: last,
            });
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(last == 0)
            .open(self.partial_path())?;
        file.seek(SeekFrom::Start(last as u64))?;
        file.write_all(&data[(last - offset) as usize..])?;
        file.flush()?;
        self.download.record_write(last, end - last);

        if self.download.total_size.is_none() {
            let written = self.download.last_written_offset as u64;
            if let Some(header) = read_prefix(&self.partial_path(), written)
                .ok()
                .and_then(|buf| sniff_header(&buf))
            {
                log::info!(
                    "Downloading {} ({} bytes) into {}",
                    header.image_id(),
                    header.image_size,
                    self.dir.display()
                );
                self.download.learn_header(&header);
            }
        }
        self.save_download_state()
    }

    fn finish_download(&mut self, final_offset: u32) -> Result<ImageId, StorageError> {
        let partial = self.partial_path();
        let header = Header::decode(&read_prefix(
            &partial,
            self.download.last_written_offset as u64,
        )?)?;
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

        // Anything past the image would make the file unloadable
        OpenOptions::new()
            .write(true)
            .open(&partial)?
            .set_len(final_offset as u64)?;

        let id = header.image_id();
        let target = self.dir.join(Self::image_file_name(&id));
        fs::rename(&partial, &target)?;
        remove_if_present(&self.state_path())?;
        log::info!("Stored {} as {}", id, target.display());

        // Same manufacturer/type/version replaces the older file
        while let Some(handle) = self.handle_of(&id) {
            if let Some(old) = self.remove(handle) {
                if old != target {
                    log::info!("Replacing {}", old.display());
                    remove_if_present(&old)?;
                }
            }
        }

        self.insert_slot(ImageSlot {
            path: target,
            file_len: final_offset as u64,
            header: OnceCell::from(Some(header.clone())),
        });
        self.download = DownloadState::complete(&header);
        Ok(id)
    }

    fn invalidate(&mut self) -> Result<(), StorageError> {
        self.reset_download()?;
        log::info!("Download area cleared");
        Ok(())
    }

    fn delete(&mut self, id: &ImageId) -> Result<(), StorageError> {
        let handle = self.handle_of(id).ok_or(StorageError::ImageNotFound(*id))?;
        if let Some(path) = self.remove(handle) {
            fs::remove_file(&path)?;
            log::info!("Deleted {}", path.display());
        }
        Ok(())
    }

    fn images(&self) -> Box<dyn Iterator<Item = ImageId> + '_> {
        Box::new(
            self.slots
                .iter()
                .flatten()
                .filter_map(ImageSlot::header)
                .map(Header::image_id),
        )
    }

    fn download_state(&self) -> DownloadState {
        self.download
    }

    fn temp_image_status(&self) -> TempImageStatus {
        match self.download.image_id {
            Some(id) if self.download.is_complete() => TempImageStatus::Complete(id),
            _ if self.download.last_written_offset > 0 => TempImageStatus::Partial(self.download),
            _ => TempImageStatus::Empty,
        }
    }

    fn info(&self) -> StorageInfo {
        StorageInfo {
            backend: "directory",
            image_count: self.images().count(),
            capacity: self.max_image_size as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ota_core::header::HardwareVersions;
    use ota_core::{ImageBuilder, TagId};
    use tempfile::tempdir;

    fn image(image_type: u16, version: u32) -> Vec<u8> {
        ImageBuilder::new(Header::new(0x1002, image_type, version))
            .tag(TagId::UPGRADE_IMAGE, vec![version as u8; 300])
            .build()
    }

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_search_picks_highest_version() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "a.ota", &image(1, 3));
        write_file(dir.path(), "b.ota", &image(1, 9));
        write_file(dir.path(), "c.ota", &image(1, 5));
        write_file(dir.path(), "other.ota", &image(2, 50));
        write_file(dir.path(), "notes.txt", b"ignored");

        let store = DirectoryStore::open(dir.path(), 4096).unwrap();
        assert_eq!(store.images().count(), 4);
        let best = store.search(0x1002, 1, None).unwrap();
        assert_eq!(best.firmware_version, 9);
    }

    #[test]
    fn test_truncated_file_is_skipped_lazily() {
        let dir = tempdir().unwrap();
        let img = image(1, 3);
        write_file(dir.path(), "short.ota", &img[..img.len() - 10]);
        write_file(dir.path(), "good.ota", &image(1, 2));

        let store = DirectoryStore::open(dir.path(), 4096).unwrap();
        assert_eq!(store.search(0x1002, 1, None).unwrap().firmware_version, 2);
        assert_eq!(store.images().count(), 1);
    }

    #[test]
    fn test_add_file_validates_eagerly() {
        let dir = tempdir().unwrap();
        let img = image(1, 3);
        let short = write_file(dir.path(), "short.bin", &img[..img.len() - 10]);
        let mut store = DirectoryStore::open(dir.path().join("store"), 4096).unwrap();
        assert!(matches!(
            store.add_file(&short),
            Err(StorageError::PartialFileFound { expected, .. }) if expected == img.len() as u32
        ));

        let garbage = write_file(dir.path(), "garbage.bin", &[0u8; 80]);
        assert!(matches!(
            store.add_file(&garbage),
            Err(StorageError::Format(ota_core::FormatError::MagicMismatch(0)))
        ));
    }

    #[test]
    fn test_handles_survive_other_removals() {
        let dir = tempdir().unwrap();
        let a = write_file(dir.path(), "a.bin", &image(1, 1));
        let b = write_file(dir.path(), "b.bin", &image(1, 2));
        let c = write_file(dir.path(), "c.bin", &image(1, 3));
        let mut store = DirectoryStore::open(dir.path().join("store"), 4096).unwrap();
        let ha = store.add_file(&a).unwrap();
        let hb = store.add_file(&b).unwrap();
        let hc = store.add_file(&c).unwrap();

        assert_eq!(store.remove(hb), Some(b));
        assert_eq!(store.header_of(ha).unwrap().firmware_version, 1);
        assert_eq!(store.header_of(hc).unwrap().firmware_version, 3);
        assert!(store.header_of(hb).is_none());

        // Freed slot gets reused
        let hb2 = store.add_file(dir.path().join("b.bin")).unwrap();
        assert_eq!(hb2, hb);
        assert_eq!(store.images().count(), 3);
    }

    #[test]
    fn test_delete_leaves_others() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "a.ota", &image(1, 1));
        write_file(dir.path(), "b.ota", &image(1, 2));
        let mut store = DirectoryStore::open(dir.path(), 4096).unwrap();
        store.delete(&ImageId::new(0x1002, 1, 1)).unwrap();

        assert!(!dir.path().join("a.ota").exists());
        let remaining: Vec<_> = store.images().collect();
        assert_eq!(remaining, vec![ImageId::new(0x1002, 1, 2)]);
        assert!(matches!(
            store.delete(&ImageId::new(0x1002, 1, 1)),
            Err(StorageError::ImageNotFound(_))
        ));
    }

    #[test]
    fn test_download_resumes_and_seals() {
        let dir = tempdir().unwrap();
        let img = image(4, 7);
        let mut store = DirectoryStore::open(dir.path(), 4096).unwrap();
        store.write_bytes(0, &img[..100]).unwrap();
        store.write_bytes(100, &img[100..200]).unwrap();
        assert!(matches!(
            store.write_bytes(300, &img[300..]),
            Err(StorageError::AlignmentRequired { offset: 300, expected: 200 })
        ));
        drop(store);

        let mut store = DirectoryStore::open(dir.path(), 4096).unwrap();
        let state = store.download_state();
        assert_eq!(state.last_written_offset, 200);
        assert_eq!(state.total_size, Some(img.len() as u32));
        assert!(store.search(0x1002, 4, None).is_none());

        store.write_bytes(150, &img[150..]).unwrap();
        let id = store.finish_download(img.len() as u32).unwrap();
        assert!(dir.path().join("1002-0004-00000007.ota").exists());
        assert!(!dir.path().join(PARTIAL_FILE).exists());
        assert_eq!(store.search(0x1002, 4, None), Some(id));
        assert_eq!(store.read_bytes(&id, 0, 4096).unwrap(), img);
        assert_eq!(store.temp_image_status(), TempImageStatus::Complete(id));
    }

    #[test]
    fn test_trailing_bytes_do_not_lose_image_on_restart() {
        let dir = tempdir().unwrap();
        let img = image(4, 9);
        let mut padded = img.clone();
        padded.extend_from_slice(&[0xEE; 20]);

        let mut store = DirectoryStore::open(dir.path(), 4096).unwrap();
        // Header arrives in the same write as the excess
        store.write_bytes(0, &padded).unwrap();
        let id = store.finish_download(img.len() as u32).unwrap();
        assert_eq!(store.search(0x1002, 4, None), Some(id));
        drop(store);

        let store = DirectoryStore::open(dir.path(), 4096).unwrap();
        assert_eq!(store.search(0x1002, 4, None), Some(id));
        assert_eq!(store.read_bytes(&id, 0, 4096).unwrap(), img);
    }

    #[test]
    fn test_write_past_announced_size_is_refused() {
        let dir = tempdir().unwrap();
        let img = image(4, 9);
        let mut store = DirectoryStore::open(dir.path(), 4096).unwrap();
        store.write_bytes(0, &img[..100]).unwrap();

        let mut tail = img[100..].to_vec();
        tail.extend_from_slice(&[0xEE; 20]);
        assert!(matches!(
            store.write_bytes(100, &tail),
            Err(StorageError::StorageFull { capacity, .. }) if capacity == img.len() as u32
        ));
        store.write_bytes(100, &img[100..]).unwrap();
        store.finish_download(img.len() as u32).unwrap();
    }

    #[test]
    fn test_finish_replaces_same_image_under_other_name() {
        let dir = tempdir().unwrap();
        let img = image(4, 9);
        write_file(dir.path(), "manual-copy.ota", &img);
        let mut store = DirectoryStore::open(dir.path(), 4096).unwrap();
        assert_eq!(store.images().count(), 1);

        store.write_bytes(0, &img).unwrap();
        let id = store.finish_download(img.len() as u32).unwrap();
        assert_eq!(store.images().collect::<Vec<_>>(), vec![id]);
        assert!(!dir.path().join("manual-copy.ota").exists());
        assert!(dir.path().join("1002-0004-00000009.ota").exists());
    }

    #[test]
    fn test_invalidate_drops_partial() {
        let dir = tempdir().unwrap();
        let img = image(4, 7);
        let mut store = DirectoryStore::open(dir.path(), 4096).unwrap();
        store.write_bytes(0, &img[..100]).unwrap();
        store.invalidate().unwrap();
        assert_eq!(store.temp_image_status(), TempImageStatus::Empty);

        let store = DirectoryStore::open(dir.path(), 4096).unwrap();
        assert_eq!(store.download_state(), DownloadState::default());
    }

    #[test]
    fn test_hardware_filter_and_size_limit() {
        let dir = tempdir().unwrap();
        let mut header = Header::new(0x1002, 1, 3);
        header.hardware_versions = Some(HardwareVersions { min: 2, max: 5 });
        let img = ImageBuilder::new(header)
            .tag(TagId::UPGRADE_IMAGE, vec![0u8; 10])
            .build();
        write_file(dir.path(), "hw.ota", &img);

        let mut store = DirectoryStore::open(dir.path(), 128).unwrap();
        assert!(store.search(0x1002, 1, Some(3)).is_some());
        assert!(store.search(0x1002, 1, Some(7)).is_none());
        assert!(matches!(
            store.write_bytes(0, &[0u8; 200]),
            Err(StorageError::StorageFull { capacity: 128, .. })
        ));
    }
}
