// OTA cluster wire format - frame header plus command payloads
//
// Frame: frame control (1) | [manufacturer code (2)] | sequence (1) | command id (1) | payload
// All multi-byte fields little-endian. Image identifiers are carried as the
// manufacturer/type/version triple in header order.

use ota_core::{ByteReader, ByteWriter, Eui64, FormatError, ImageId};
use thiserror::Error;

pub mod frame_control {
    pub const CLUSTER_SPECIFIC: u8 = 0x01;
    pub const MANUFACTURER_SPECIFIC: u8 = 0x04;
    pub const SERVER_TO_CLIENT: u8 = 0x08;
    pub const DISABLE_DEFAULT_RESPONSE: u8 = 0x10;
}

pub mod command {
    pub const IMAGE_NOTIFY: u8 = 0x00;
    pub const QUERY_NEXT_IMAGE_REQUEST: u8 = 0x01;
    pub const QUERY_NEXT_IMAGE_RESPONSE: u8 = 0x02;
    pub const IMAGE_BLOCK_REQUEST: u8 = 0x03;
    pub const IMAGE_PAGE_REQUEST: u8 = 0x04;
    pub const IMAGE_BLOCK_RESPONSE: u8 = 0x05;
    pub const UPGRADE_END_REQUEST: u8 = 0x06;
    pub const UPGRADE_END_RESPONSE: u8 = 0x07;
    pub const QUERY_SPECIFIC_FILE_REQUEST: u8 = 0x08;
    pub const QUERY_SPECIFIC_FILE_RESPONSE: u8 = 0x09;
    /// Global, not cluster-specific.
    pub const DEFAULT_RESPONSE: u8 = 0x0B;
}

const QUERY_HARDWARE_VERSION_PRESENT: u8 = 0x01;
const BLOCK_REQUESTER_PRESENT: u8 = 0x01;
const BLOCK_MIN_PERIOD_PRESENT: u8 = 0x02;
const PAGE_REQUESTER_PRESENT: u8 = 0x01;

/// Upgrade time meaning "do not upgrade until told otherwise".
pub const UPGRADE_TIME_WAIT_FOREVER: u32 = 0xFFFF_FFFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] FormatError),

    #[error("unknown command 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("unknown status 0x{0:02X}")]
    UnknownStatus(u8),

    #[error("frame sent in the wrong direction")]
    WrongDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    MalformedCommand,
    UnsupportedCommand,
    InvalidField,
    Abort,
    InvalidImage,
    WaitForData,
    NoImageAvailable,
    RequireMoreImage,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Success => 0x00,
            Status::MalformedCommand => 0x80,
            Status::UnsupportedCommand => 0x81,
            Status::InvalidField => 0x85,
            Status::Abort => 0x95,
            Status::InvalidImage => 0x96,
            Status::WaitForData => 0x97,
            Status::NoImageAvailable => 0x98,
            Status::RequireMoreImage => 0x99,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, WireError> {
        Ok(match code {
            0x00 => Status::Success,
            0x80 => Status::MalformedCommand,
            0x81 => Status::UnsupportedCommand,
            0x85 => Status::InvalidField,
            0x95 => Status::Abort,
            0x96 => Status::InvalidImage,
            0x97 => Status::WaitForData,
            0x98 => Status::NoImageAvailable,
            0x99 => Status::RequireMoreImage,
            other => return Err(WireError::UnknownStatus(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_control: u8,
    pub manufacturer_code: Option<u16>,
    pub sequence: u8,
    pub command_id: u8,
}

impl FrameHeader {
    pub fn client_to_server(sequence: u8, command_id: u8) -> Self {
        Self {
            frame_control: frame_control::CLUSTER_SPECIFIC,
            manufacturer_code: None,
            sequence,
            command_id,
        }
    }

    pub fn server_to_client(sequence: u8, command_id: u8) -> Self {
        Self {
            frame_control: frame_control::CLUSTER_SPECIFIC
                | frame_control::SERVER_TO_CLIENT
                | frame_control::DISABLE_DEFAULT_RESPONSE,
            manufacturer_code: None,
            sequence,
            command_id,
        }
    }

    pub fn default_response(sequence: u8) -> Self {
        Self {
            frame_control: frame_control::SERVER_TO_CLIENT
                | frame_control::DISABLE_DEFAULT_RESPONSE,
            manufacturer_code: None,
            sequence,
            command_id: command::DEFAULT_RESPONSE,
        }
    }

    pub fn is_cluster_specific(&self) -> bool {
        self.frame_control & 0x03 == frame_control::CLUSTER_SPECIFIC
    }

    pub fn is_server_to_client(&self) -> bool {
        self.frame_control & frame_control::SERVER_TO_CLIENT != 0
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let frame_control = r.u8()?;
        let manufacturer_code = if frame_control & frame_control::MANUFACTURER_SPECIFIC != 0 {
            Some(r.u16_le()?)
        } else {
            None
        };
        Ok(Self {
            frame_control,
            manufacturer_code,
            sequence: r.u8()?,
            command_id: r.u8()?,
        })
    }

    pub fn encode(&self, w: &mut ByteWriter) {
        match self.manufacturer_code {
            Some(code) => {
                w.u8(self.frame_control | frame_control::MANUFACTURER_SPECIFIC)
                    .u16_le(code);
            }
            None => {
                w.u8(self.frame_control & !frame_control::MANUFACTURER_SPECIFIC);
            }
        }
        w.u8(self.sequence).u8(self.command_id);
    }
}

fn read_image(r: &mut ByteReader<'_>) -> Result<ImageId, FormatError> {
    Ok(ImageId::new(r.u16_le()?, r.u16_le()?, r.u32_le()?))
}

fn write_image(w: &mut ByteWriter, image: &ImageId) {
    w.u16_le(image.manufacturer_id)
        .u16_le(image.image_type_id)
        .u32_le(image.firmware_version);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryNextImageRequest {
    pub current: ImageId,
    pub hardware_version: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBlockRequest {
    pub image: ImageId,
    pub offset: u32,
    pub max_data_size: u8,
    pub requester: Option<Eui64>,
    /// Minimum block period the client is currently using.
    pub min_block_period: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePageRequest {
    pub image: ImageId,
    pub offset: u32,
    pub max_data_size: u8,
    pub page_size: u16,
    /// Milliseconds between the block responses of the page.
    pub response_spacing: u16,
    pub requester: Option<Eui64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeEndRequest {
    pub status: Status,
    pub image: ImageId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpecificFileRequest {
    pub requester: Eui64,
    pub image: ImageId,
    pub stack_version: u16,
}

/// Commands a node sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    QueryNextImage(QueryNextImageRequest),
    ImageBlock(ImageBlockRequest),
    ImagePage(ImagePageRequest),
    UpgradeEnd(UpgradeEndRequest),
    QuerySpecificFile(QuerySpecificFileRequest),
}

impl ClientCommand {
    pub fn command_id(&self) -> u8 {
        match self {
            ClientCommand::QueryNextImage(_) => command::QUERY_NEXT_IMAGE_REQUEST,
            ClientCommand::ImageBlock(_) => command::IMAGE_BLOCK_REQUEST,
            ClientCommand::ImagePage(_) => command::IMAGE_PAGE_REQUEST,
            ClientCommand::UpgradeEnd(_) => command::UPGRADE_END_REQUEST,
            ClientCommand::QuerySpecificFile(_) => command::QUERY_SPECIFIC_FILE_REQUEST,
        }
    }

    pub fn decode(command_id: u8, payload: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(payload);
        let cmd = match command_id {
            command::QUERY_NEXT_IMAGE_REQUEST => {
                let control = r.u8()?;
                let current = read_image(&mut r)?;
                let hardware_version = if control & QUERY_HARDWARE_VERSION_PRESENT != 0 {
                    Some(r.u16_le()?)
                } else {
                    None
                };
                ClientCommand::QueryNextImage(QueryNextImageRequest {
                    current,
                    hardware_version,
                })
            }
            command::IMAGE_BLOCK_REQUEST => {
                let control = r.u8()?;
                let image = read_image(&mut r)?;
                let offset = r.u32_le()?;
                let max_data_size = r.u8()?;
                let requester = if control & BLOCK_REQUESTER_PRESENT != 0 {
                    Some(Eui64(r.array()?))
                } else {
                    None
                };
                let min_block_period = if control & BLOCK_MIN_PERIOD_PRESENT != 0 {
                    Some(r.u16_le()?)
                } else {
                    None
                };
                ClientCommand::ImageBlock(ImageBlockRequest {
                    image,
                    offset,
                    max_data_size,
                    requester,
                    min_block_period,
                })
            }
            command::IMAGE_PAGE_REQUEST => {
                let control = r.u8()?;
                let image = read_image(&mut r)?;
                let offset = r.u32_le()?;
                let max_data_size = r.u8()?;
                let page_size = r.u16_le()?;
                let response_spacing = r.u16_le()?;
                let requester = if control & PAGE_REQUESTER_PRESENT != 0 {
                    Some(Eui64(r.array()?))
                } else {
                    None
                };
                ClientCommand::ImagePage(ImagePageRequest {
                    image,
                    offset,
                    max_data_size,
                    page_size,
                    response_spacing,
                    requester,
                })
            }
            command::UPGRADE_END_REQUEST => {
                let status = Status::from_code(r.u8()?)?;
                let image = read_image(&mut r)?;
                ClientCommand::UpgradeEnd(UpgradeEndRequest { status, image })
            }
            command::QUERY_SPECIFIC_FILE_REQUEST => {
                let requester = Eui64(r.array()?);
                let image = read_image(&mut r)?;
                let stack_version = r.u16_le()?;
                ClientCommand::QuerySpecificFile(QuerySpecificFileRequest {
                    requester,
                    image,
                    stack_version,
                })
            }
            other => return Err(WireError::UnknownCommand(other)),
        };
        Ok(cmd)
    }

    pub fn encode_payload(&self, w: &mut ByteWriter) {
        match self {
            ClientCommand::QueryNextImage(req) => {
                let control = if req.hardware_version.is_some() {
                    QUERY_HARDWARE_VERSION_PRESENT
                } else {
                    0
                };
                w.u8(control);
                write_image(w, &req.current);
                if let Some(hw) = req.hardware_version {
                    w.u16_le(hw);
                }
            }
            ClientCommand::ImageBlock(req) => {
                let mut control = 0;
                if req.requester.is_some() {
                    control |= BLOCK_REQUESTER_PRESENT;
                }
                if req.min_block_period.is_some() {
                    control |= BLOCK_MIN_PERIOD_PRESENT;
                }
                w.u8(control);
                write_image(w, &req.image);
                w.u32_le(req.offset).u8(req.max_data_size);
                if let Some(eui) = req.requester {
                    w.bytes(&eui.0);
                }
                if let Some(period) = req.min_block_period {
                    w.u16_le(period);
                }
            }
            ClientCommand::ImagePage(req) => {
                let control = if req.requester.is_some() {
                    PAGE_REQUESTER_PRESENT
                } else {
                    0
                };
                w.u8(control);
                write_image(w, &req.image);
                w.u32_le(req.offset)
                    .u8(req.max_data_size)
                    .u16_le(req.page_size)
                    .u16_le(req.response_spacing);
                if let Some(eui) = req.requester {
                    w.bytes(&eui.0);
                }
            }
            ClientCommand::UpgradeEnd(req) => {
                w.u8(req.status.code());
                write_image(w, &req.image);
            }
            ClientCommand::QuerySpecificFile(req) => {
                w.bytes(&req.requester.0);
                write_image(w, &req.image);
                w.u16_le(req.stack_version);
            }
        }
    }

    pub fn to_frame(&self, sequence: u8) -> Vec<u8> {
        let mut w = ByteWriter::new();
        FrameHeader::client_to_server(sequence, self.command_id()).encode(&mut w);
        self.encode_payload(&mut w);
        w.into_vec()
    }
}

/// Answer to QueryNextImage and QuerySpecificFile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryImageResponse {
    Available { image: ImageId, image_size: u32 },
    Unavailable(Status),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageBlockResponse {
    Data {
        image: ImageId,
        offset: u32,
        data: Vec<u8>,
    },
    /// Times are in seconds; a current time of zero makes the request time
    /// a relative delay.
    WaitForData {
        current_time: u32,
        request_time: u32,
        min_block_period: u16,
    },
    /// Any other status, which carries no payload.
    Status(Status),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeEndResponse {
    pub image: ImageId,
    pub current_time: u32,
    pub upgrade_time: u32,
}

/// Fields are a prefix: a later field is only sent when every earlier one is.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageNotify {
    pub query_jitter: u8,
    pub manufacturer_id: Option<u16>,
    pub image_type_id: Option<u16>,
    pub firmware_version: Option<u32>,
}

impl ImageNotify {
    pub fn for_image(image: &ImageId, query_jitter: u8) -> Self {
        Self {
            query_jitter,
            manufacturer_id: Some(image.manufacturer_id),
            image_type_id: Some(image.image_type_id),
            firmware_version: Some(image.firmware_version),
        }
    }

    pub fn payload_type(&self) -> u8 {
        match (self.manufacturer_id, self.image_type_id, self.firmware_version) {
            (None, _, _) => 0,
            (Some(_), None, _) => 1,
            (Some(_), Some(_), None) => 2,
            (Some(_), Some(_), Some(_)) => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultResponse {
    pub command_id: u8,
    pub status: Status,
}

/// Commands the server sends to nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommand {
    ImageNotify(ImageNotify),
    QueryNextImage(QueryImageResponse),
    ImageBlock(ImageBlockResponse),
    UpgradeEnd(UpgradeEndResponse),
    QuerySpecificFile(QueryImageResponse),
    Default(DefaultResponse),
}

impl ServerCommand {
    pub fn command_id(&self) -> u8 {
        match self {
            ServerCommand::ImageNotify(_) => command::IMAGE_NOTIFY,
            ServerCommand::QueryNextImage(_) => command::QUERY_NEXT_IMAGE_RESPONSE,
            ServerCommand::ImageBlock(_) => command::IMAGE_BLOCK_RESPONSE,
            ServerCommand::UpgradeEnd(_) => command::UPGRADE_END_RESPONSE,
            ServerCommand::QuerySpecificFile(_) => command::QUERY_SPECIFIC_FILE_RESPONSE,
            ServerCommand::Default(_) => command::DEFAULT_RESPONSE,
        }
    }

    fn encode_query(w: &mut ByteWriter, rsp: &QueryImageResponse) {
        match rsp {
            QueryImageResponse::Available { image, image_size } => {
                w.u8(Status::Success.code());
                write_image(w, image);
                w.u32_le(*image_size);
            }
            QueryImageResponse::Unavailable(status) => {
                w.u8(status.code());
            }
        }
    }

    fn decode_query(r: &mut ByteReader<'_>) -> Result<QueryImageResponse, WireError> {
        match Status::from_code(r.u8()?)? {
            Status::Success => Ok(QueryImageResponse::Available {
                image: read_image(r)?,
                image_size: r.u32_le()?,
            }),
            status => Ok(QueryImageResponse::Unavailable(status)),
        }
    }

    pub fn encode_payload(&self, w: &mut ByteWriter) {
        match self {
            ServerCommand::ImageNotify(notify) => {
                w.u8(notify.payload_type()).u8(notify.query_jitter);
                let kind = notify.payload_type();
                if let (true, Some(mfg)) = (kind >= 1, notify.manufacturer_id) {
                    w.u16_le(mfg);
                }
                if let (true, Some(image_type)) = (kind >= 2, notify.image_type_id) {
                    w.u16_le(image_type);
                }
                if let (true, Some(version)) = (kind >= 3, notify.firmware_version) {
                    w.u32_le(version);
                }
            }
            ServerCommand::QueryNextImage(rsp) | ServerCommand::QuerySpecificFile(rsp) => {
                Self::encode_query(w, rsp)
            }
            ServerCommand::ImageBlock(rsp) => match rsp {
                ImageBlockResponse::Data {
                    image,
                    offset,
                    data,
                } => {
                    w.u8(Status::Success.code());
                    write_image(w, image);
                    w.u32_le(*offset).u8(data.len() as u8).bytes(data);
                }
                ImageBlockResponse::WaitForData {
                    current_time,
                    request_time,
                    min_block_period,
                } => {
                    w.u8(Status::WaitForData.code())
                        .u32_le(*current_time)
                        .u32_le(*request_time)
                        .u16_le(*min_block_period);
                }
                ImageBlockResponse::Status(status) => {
                    w.u8(status.code());
                }
            },
            ServerCommand::UpgradeEnd(rsp) => {
                write_image(w, &rsp.image);
                w.u32_le(rsp.current_time).u32_le(rsp.upgrade_time);
            }
            ServerCommand::Default(rsp) => {
                w.u8(rsp.command_id).u8(rsp.status.code());
            }
        }
    }

    pub fn decode(command_id: u8, payload: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(payload);
        let cmd = match command_id {
            command::IMAGE_NOTIFY => {
                let kind = r.u8()?;
                let mut notify = ImageNotify {
                    query_jitter: r.u8()?,
                    ..Default::default()
                };
                if kind >= 1 {
                    notify.manufacturer_id = Some(r.u16_le()?);
                }
                if kind >= 2 {
                    notify.image_type_id = Some(r.u16_le()?);
                }
                if kind >= 3 {
                    notify.firmware_version = Some(r.u32_le()?);
                }
                ServerCommand::ImageNotify(notify)
            }
            command::QUERY_NEXT_IMAGE_RESPONSE => {
                ServerCommand::QueryNextImage(Self::decode_query(&mut r)?)
            }
            command::QUERY_SPECIFIC_FILE_RESPONSE => {
                ServerCommand::QuerySpecificFile(Self::decode_query(&mut r)?)
            }
            command::IMAGE_BLOCK_RESPONSE => {
                let rsp = match Status::from_code(r.u8()?)? {
                    Status::Success => {
                        let image = read_image(&mut r)?;
                        let offset = r.u32_le()?;
                        let len = r.u8()? as usize;
                        ImageBlockResponse::Data {
                            image,
                            offset,
                            data: r.bytes(len)?.to_vec(),
                        }
                    }
                    Status::WaitForData => ImageBlockResponse::WaitForData {
                        current_time: r.u32_le()?,
                        request_time: r.u32_le()?,
                        min_block_period: r.u16_le()?,
                    },
                    status => ImageBlockResponse::Status(status),
                };
                ServerCommand::ImageBlock(rsp)
            }
            command::UPGRADE_END_RESPONSE => ServerCommand::UpgradeEnd(UpgradeEndResponse {
                image: read_image(&mut r)?,
                current_time: r.u32_le()?,
                upgrade_time: r.u32_le()?,
            }),
            other => return Err(WireError::UnknownCommand(other)),
        };
        Ok(cmd)
    }

    pub fn to_frame(&self, sequence: u8) -> Vec<u8> {
        let mut w = ByteWriter::new();
        let header = match self {
            ServerCommand::Default(_) => FrameHeader::default_response(sequence),
            _ => FrameHeader::server_to_client(sequence, self.command_id()),
        };
        header.encode(&mut w);
        self.encode_payload(&mut w);
        w.into_vec()
    }
}

/// Split a frame sent by a node.
pub fn parse_client_frame(frame: &[u8]) -> Result<(FrameHeader, ClientCommand), WireError> {
    let mut r = ByteReader::new(frame);
    let header = FrameHeader::decode(&mut r)?;
    if header.is_server_to_client() {
        return Err(WireError::WrongDirection);
    }
    if !header.is_cluster_specific() {
        return Err(WireError::UnknownCommand(header.command_id));
    }
    let cmd = ClientCommand::decode(header.command_id, r.rest())?;
    Ok((header, cmd))
}

/// Split a frame sent by the server, including global default responses.
pub fn parse_server_frame(frame: &[u8]) -> Result<(FrameHeader, ServerCommand), WireError> {
    let mut r = ByteReader::new(frame);
    let header = FrameHeader::decode(&mut r)?;
    if !header.is_server_to_client() {
        return Err(WireError::WrongDirection);
    }
    if !header.is_cluster_specific() {
        if header.command_id != command::DEFAULT_RESPONSE {
            return Err(WireError::UnknownCommand(header.command_id));
        }
        let command_id = r.u8()?;
        let status = Status::from_code(r.u8()?)?;
        return Ok((
            header,
            ServerCommand::Default(DefaultResponse { command_id, status }),
        ));
    }
    let cmd = ServerCommand::decode(header.command_id, r.rest())?;
    Ok((header, cmd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_next_image_layout() {
        let cmd = ClientCommand::QueryNextImage(QueryNextImageRequest {
            current: ImageId::new(0x1002, 0x0007, 0x0000_0003),
            hardware_version: Some(3),
        });
        let frame = cmd.to_frame(0x42);
        assert_eq!(
            frame,
            vec![
                0x01, 0x42, 0x01, // header
                0x01, // hardware version present
                0x02, 0x10, 0x07, 0x00, 0x03, 0x00, 0x00, 0x00, // triple
                0x03, 0x00,
            ]
        );
        let (header, parsed) = parse_client_frame(&frame).unwrap();
        assert_eq!(header.sequence, 0x42);
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn test_block_request_optional_fields() {
        let cmd = ClientCommand::ImageBlock(ImageBlockRequest {
            image: ImageId::new(1, 2, 3),
            offset: 0x100,
            max_data_size: 48,
            requester: None,
            min_block_period: Some(250),
        });
        let frame = cmd.to_frame(1);
        // control byte says only the period is present
        assert_eq!(frame[3], BLOCK_MIN_PERIOD_PRESENT);
        assert_eq!(frame.len(), 3 + 1 + 8 + 4 + 1 + 2);
        assert_eq!(parse_client_frame(&frame).unwrap().1, cmd);
    }

    #[test]
    fn test_block_response_forms() {
        let data = ServerCommand::ImageBlock(ImageBlockResponse::Data {
            image: ImageId::new(1, 2, 3),
            offset: 64,
            data: vec![0xAA; 5],
        });
        let frame = data.to_frame(9);
        assert_eq!(frame[0], 0x19);
        assert_eq!(parse_server_frame(&frame).unwrap().1, data);

        let wait = ServerCommand::ImageBlock(ImageBlockResponse::WaitForData {
            current_time: 10,
            request_time: 70,
            min_block_period: 500,
        });
        assert_eq!(parse_server_frame(&wait.to_frame(9)).unwrap().1, wait);

        let abort = ServerCommand::ImageBlock(ImageBlockResponse::Status(Status::Abort));
        assert_eq!(abort.to_frame(9), vec![0x19, 9, 0x05, 0x95]);
    }

    #[test]
    fn test_default_response_is_global() {
        let rsp = ServerCommand::Default(DefaultResponse {
            command_id: command::IMAGE_PAGE_REQUEST,
            status: Status::UnsupportedCommand,
        });
        let frame = rsp.to_frame(7);
        assert_eq!(frame, vec![0x18, 7, 0x0B, 0x04, 0x81]);
        assert_eq!(parse_server_frame(&frame).unwrap().1, rsp);
    }

    #[test]
    fn test_image_notify_prefix() {
        let notify = ImageNotify {
            query_jitter: 100,
            manufacturer_id: Some(0x1002),
            image_type_id: None,
            firmware_version: Some(5),
        };
        assert_eq!(notify.payload_type(), 1);
        let frame = ServerCommand::ImageNotify(notify).to_frame(0);
        assert_eq!(&frame[3..], &[1, 100, 0x02, 0x10]);

        let full = ImageNotify::for_image(&ImageId::new(1, 2, 3), 50);
        let cmd = ServerCommand::ImageNotify(full);
        assert_eq!(parse_server_frame(&cmd.to_frame(0)).unwrap().1, cmd);
    }

    #[test]
    fn test_manufacturer_specific_header() {
        let header = FrameHeader {
            frame_control: frame_control::CLUSTER_SPECIFIC,
            manufacturer_code: Some(0x1234),
            sequence: 5,
            command_id: command::UPGRADE_END_REQUEST,
        };
        let mut w = ByteWriter::new();
        header.encode(&mut w);
        let bytes = w.into_vec();
        assert_eq!(bytes, vec![0x05, 0x34, 0x12, 5, 0x06]);
        let decoded = FrameHeader::decode(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(decoded.manufacturer_code, Some(0x1234));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            parse_client_frame(&[0x01, 0x00, 0x03, 0x00, 0x01]),
            Err(WireError::Malformed(FormatError::Truncated { .. }))
        ));
        assert_eq!(
            parse_client_frame(&[0x01, 0x00, 0x42]).unwrap_err(),
            WireError::UnknownCommand(0x42)
        );
        assert_eq!(
            parse_client_frame(&[0x19, 0x00, 0x01]).unwrap_err(),
            WireError::WrongDirection
        );
        assert_eq!(
            parse_client_frame(&[0x01, 0x00, 0x06, 0x42, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap_err(),
            WireError::UnknownStatus(0x42)
        );
    }
}
