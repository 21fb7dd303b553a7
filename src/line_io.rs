// Line framing for the server binary
//
// Input, one per line:
//   <node-hex> <frame-hex>               frame received from a node
//   notify <mfg> <type> <version> [jit]  announce a stored image (hex ids)
//   tick                                 housekeeping only
// Blank lines and lines starting with '#' are skipped.
//
// Output, one line per frame to send:
//   <node-hex> <spacing-ms> <frame-hex>

use ota_core::ImageId;
use thiserror::Error;

use crate::ota::{NodeId, Reply};

/// Destination used for notify frames.
pub const BROADCAST: NodeId = NodeId(0xFFFF);

/// Jitter sent when a notify line does not give one.
pub const DEFAULT_QUERY_JITTER: u8 = 100;

#[derive(Debug, Error)]
pub enum LineError {
    #[error("expected {0}")]
    Missing(&'static str),
    #[error("bad number '{0}'")]
    BadNumber(String),
    #[error("bad frame hex: {0}")]
    BadHex(#[from] hex::FromHexError),
    #[error("unexpected trailing input '{0}'")]
    Trailing(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame { source: NodeId, frame: Vec<u8> },
    Notify { image: ImageId, query_jitter: u8 },
    Tick,
}

fn hex_field<T>(field: Option<&str>, what: &'static str) -> Result<T, LineError>
where
    T: TryFrom<u64>,
{
    let raw = field.ok_or(LineError::Missing(what))?;
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    u64::from_str_radix(digits, 16)
        .ok()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| LineError::BadNumber(raw.to_string()))
}

/// `Ok(None)` for lines that carry nothing.
pub fn parse_line(line: &str) -> Result<Option<Inbound>, LineError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut fields = line.split_whitespace();
    let first = fields.next().ok_or(LineError::Missing("node id"))?;
    let inbound = match first {
        "tick" => Inbound::Tick,
        "notify" => {
            let manufacturer_id = hex_field(fields.next(), "manufacturer id")?;
            let image_type_id = hex_field(fields.next(), "image type")?;
            let firmware_version = hex_field(fields.next(), "firmware version")?;
            let query_jitter = match fields.next() {
                Some(raw) => raw
                    .parse::<u8>()
                    .map_err(|_| LineError::BadNumber(raw.to_string()))?,
                None => DEFAULT_QUERY_JITTER,
            };
            Inbound::Notify {
                image: ImageId::new(manufacturer_id, image_type_id, firmware_version),
                query_jitter,
            }
        }
        node => {
            let source = node
                .parse::<NodeId>()
                .map_err(|_| LineError::BadNumber(node.to_string()))?;
            let frame = hex::decode(fields.next().ok_or(LineError::Missing("frame"))?)?;
            Inbound::Frame { source, frame }
        }
    };

    match fields.next() {
        Some(extra) => Err(LineError::Trailing(extra.to_string())),
        None => Ok(Some(inbound)),
    }
}

pub fn format_frame(destination: NodeId, spacing_ms: u16, frame: &[u8]) -> String {
    format!("{:04x} {} {}", destination.0, spacing_ms, hex::encode(frame))
}

/// One output line per frame. Only frames after the first carry the spacing.
pub fn format_reply(reply: &Reply) -> Vec<String> {
    reply
        .frames
        .iter()
        .enumerate()
        .map(|(i, frame)| {
            let spacing = if i == 0 { 0 } else { reply.spacing_ms };
            format_frame(reply.destination, spacing, frame)
        })
        .collect()
}
