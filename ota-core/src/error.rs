use thiserror::Error;

/// Errors produced while decoding or walking an OTA image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("bad magic number 0x{0:08X}")]
    MagicMismatch(u32),

    #[error("unsupported header version 0x{0:04X}")]
    UnsupportedHeaderVersion(u16),

    #[error("truncated input: needed {needed} bytes at position {position}, {available} available")]
    Truncated {
        position: usize,
        needed: usize,
        available: usize,
    },

    #[error("header length field says {declared} bytes but the fields occupy {actual}")]
    HeaderLengthMismatch { declared: u16, actual: u16 },

    #[error("tag chain runs past image size {image_size} at offset {offset}")]
    TruncatedTagChain { offset: u32, image_size: u32 },

    #[error("read of {length} bytes at offset {offset} is outside the image ({limit} bytes)")]
    OffsetOutOfRange { offset: u32, length: u32, limit: u32 },

    #[error("tag 0x{0:04X} not found")]
    TagNotFound(u16),

    /// The byte source behind a tag walk failed, e.g. storage I/O.
    #[error("reading image at offset {offset}: {reason}")]
    SourceRead { offset: u32, reason: String },
}

impl FormatError {
    /// True when the bytes simply are not an OTA image (as opposed to a
    /// damaged one). Callers surface both as "no valid image present".
    pub fn is_foreign(&self) -> bool {
        matches!(
            self,
            FormatError::MagicMismatch(_) | FormatError::UnsupportedHeaderVersion(_)
        )
    }
}
