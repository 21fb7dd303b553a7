/// Raw non-volatile memory underneath the single-slot and page-erase stores.
use super::StorageError;

pub trait FlashDevice {
    fn capacity(&self) -> u32;

    fn page_size(&self) -> u32;

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), StorageError>;

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Begin erasing one page. Completion is observed through `is_busy`.
    fn start_erase(&mut self, page: u32) -> Result<(), StorageError>;

    /// Poll the device. Returns false once any outstanding erase finished.
    fn is_busy(&mut self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSemantics {
    /// EEPROM/RAM: bytes are simply replaced.
    Overwrite,
    /// NOR flash: programming can only clear bits; erase sets them again.
    ClearBitsOnly,
}

/// In-memory device, used on the host for the RAM/EEPROM slot and to
/// emulate flash with a configurable erase latency.
#[derive(Debug, Clone)]
pub struct RamFlash {
    data: Vec<u8>,
    page_size: u32,
    semantics: WriteSemantics,
    erase_polls: u32,
    pending: Option<PendingErase>,
}

#[derive(Debug, Clone, Copy)]
struct PendingErase {
    page: u32,
    polls_left: u32,
}

impl RamFlash {
    pub fn eeprom(capacity: u32) -> Self {
        Self {
            data: vec![0xFF; capacity as usize],
            page_size: 1,
            semantics: WriteSemantics::Overwrite,
            erase_polls: 0,
            pending: None,
        }
    }

    /// Flash that reports busy for `erase_polls` polls after each erase.
    pub fn nor(capacity: u32, page_size: u32, erase_polls: u32) -> Self {
        Self {
            data: vec![0xFF; capacity as usize],
            page_size: page_size.max(1),
            semantics: WriteSemantics::ClearBitsOnly,
            erase_polls,
            pending: None,
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Simulates losing power: an outstanding erase never completes and
    /// the page keeps whatever it held.
    pub fn power_cycle(mut self) -> Self {
        if let Some(pending) = self.pending.take() {
            log::debug!("Power lost during erase of page {}", pending.page);
        }
        self
    }

    fn range(&self, address: u32, len: usize) -> Result<std::ops::Range<usize>, StorageError> {
        let start = address as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(StorageError::OffsetOutOfRange {
                offset: address,
                length: len as u32,
            });
        }
        Ok(start..end)
    }

    fn finish_erase(&mut self, page: u32) {
        let start = (page * self.page_size) as usize;
        let end = (start + self.page_size as usize).min(self.data.len());
        self.data[start..end].fill(0xFF);
    }
}

impl FlashDevice for RamFlash {
    fn capacity(&self) -> u32 {
        self.data.len() as u32
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let range = self.range(address, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), StorageError> {
        if self.pending.is_some() {
            return Err(StorageError::EraseInProgress);
        }
        let range = self.range(address, data.len())?;
        match self.semantics {
            WriteSemantics::Overwrite => self.data[range].copy_from_slice(data),
            WriteSemantics::ClearBitsOnly => {
                for (cell, byte) in self.data[range].iter_mut().zip(data) {
                    *cell &= *byte;
                }
            }
        }
        Ok(())
    }

    fn start_erase(&mut self, page: u32) -> Result<(), StorageError> {
        if self.pending.is_some() {
            return Err(StorageError::EraseInProgress);
        }
        self.range(page * self.page_size, self.page_size as usize)?;
        if self.erase_polls == 0 {
            self.finish_erase(page);
        } else {
            self.pending = Some(PendingErase {
                page,
                polls_left: self.erase_polls,
            });
        }
        Ok(())
    }

    fn is_busy(&mut self) -> bool {
        match self.pending {
            None => false,
            Some(mut pending) => {
                pending.polls_left = pending.polls_left.saturating_sub(1);
                if pending.polls_left == 0 {
                    self.pending = None;
                    self.finish_erase(pending.page);
                    false
                } else {
                    self.pending = Some(pending);
                    true
                }
            }
        }
    }
}
