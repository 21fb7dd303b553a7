// OTA Server - protocol engine answering node requests from an image catalog
//
// Every request is handled to completion before the next one is looked at.
// The only state carried between requests is the client rate table, the
// per-destination link info and the last transfer logged.

use std::collections::HashMap;

use ota_core::{ByteReader, ImageId};

use super::policy::{ConfiguredPolicy, LinkConfig, LinkInfo, PeriodUnits, PolicyConfig};
use super::rate_limiter::{ClientRateTable, ClientUnits};
use super::wire::{
    command, parse_client_frame, ClientCommand, DefaultResponse, FrameHeader, ImageBlockRequest,
    ImageBlockResponse, ImageNotify, ImagePageRequest, QueryImageResponse, QueryNextImageRequest,
    QuerySpecificFileRequest, ServerCommand, Status, UpgradeEndRequest, UpgradeEndResponse,
    WireError, UPGRADE_TIME_WAIT_FOREVER,
};
use super::{NodeId, ServerPolicy, UpgradeDisposition};
use crate::storage::ImageCatalog;

/// Upper bound on block responses produced for one page request.
pub const MAX_BLOCKS_PER_PAGE: usize = 128;

/// Block period handed out when discovering which units a node uses. A node
/// reading it as seconds pauses noticeably before its next request.
pub const UNITS_DISCOVERY_PERIOD: u16 = 3;

/// Frames to send to one node, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub destination: NodeId,
    pub frames: Vec<Vec<u8>>,
    /// Gap to leave between consecutive frames.
    pub spacing_ms: u16,
}

pub struct OtaServer<C: ImageCatalog, P: ServerPolicy = ConfiguredPolicy> {
    catalog: C,
    policy: P,
    clients: ClientRateTable,
    links: HashMap<NodeId, LinkInfo>,
    over_capacity: bool,
    last_transfer: Option<(ImageId, NodeId)>,
    notify_sequence: u8,
}

impl<C: ImageCatalog> OtaServer<C, ConfiguredPolicy> {
    pub fn from_config(catalog: C, policy: &PolicyConfig, link: &LinkConfig) -> Self {
        let clients = ClientRateTable::new(policy.max_clients, policy.client_timeout_secs);
        Self::new(
            catalog,
            ConfiguredPolicy::new(policy.clone(), link.clone()),
            clients,
        )
    }
}

impl<C: ImageCatalog, P: ServerPolicy> OtaServer<C, P> {
    pub fn new(catalog: C, policy: P, clients: ClientRateTable) -> Self {
        Self {
            catalog,
            policy,
            clients,
            links: HashMap::new(),
            over_capacity: false,
            last_transfer: None,
            notify_sequence: 0,
        }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut C {
        &mut self.catalog
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    pub fn clients(&self) -> &ClientRateTable {
        &self.clients
    }

    /// While set, every block request is told to come back later.
    pub fn set_over_capacity(&mut self, over_capacity: bool) {
        if self.over_capacity != over_capacity {
            log::info!(
                "Server {} block requests",
                if over_capacity { "deferring" } else { "accepting" }
            );
        }
        self.over_capacity = over_capacity;
    }

    /// Route properties towards one node, as learned by the transport.
    pub fn set_link_info(&mut self, node: NodeId, link: LinkInfo) {
        self.links.insert(node, link);
    }

    pub fn clear_link_info(&mut self, node: NodeId) {
        self.links.remove(&node);
    }

    fn link_for(&self, node: NodeId) -> LinkInfo {
        self.links
            .get(&node)
            .copied()
            .unwrap_or_else(|| self.policy.default_link())
    }

    /// Periodic housekeeping: storage background work and client aging.
    pub fn tick(&mut self, now_ms: u64) {
        self.catalog.tick();
        let expired = self.clients.expire(now_ms);
        if expired > 0 && self.clients.is_empty() {
            self.last_transfer = None;
        }
    }

    /// Frame announcing an image, for the transport to broadcast.
    pub fn image_notify(&mut self, image: &ImageId, query_jitter: u8) -> Vec<u8> {
        let sequence = self.notify_sequence;
        self.notify_sequence = self.notify_sequence.wrapping_add(1);
        log::info!("Announcing {} (jitter {})", image, query_jitter);
        ServerCommand::ImageNotify(ImageNotify::for_image(image, query_jitter)).to_frame(sequence)
    }

    /// Decode one frame from `source` and produce whatever has to go back.
    pub fn handle_frame(&mut self, source: NodeId, frame: &[u8], now_ms: u64) -> Option<Reply> {
        match parse_client_frame(frame) {
            Ok((header, cmd)) => self.handle_command(source, header.sequence, cmd, now_ms),
            Err(WireError::WrongDirection) => {
                log::debug!("Ignoring server-to-client frame from {}", source);
                None
            }
            Err(e) => {
                let header = FrameHeader::decode(&mut ByteReader::new(frame)).ok()?;
                if !header.is_cluster_specific() {
                    log::debug!(
                        "Ignoring global command 0x{:02X} from {}",
                        header.command_id,
                        source
                    );
                    return None;
                }
                let status = match e {
                    WireError::UnknownCommand(_) => Status::UnsupportedCommand,
                    WireError::UnknownStatus(_) => Status::InvalidField,
                    _ => Status::MalformedCommand,
                };
                log::warn!("Bad frame from {}: {}", source, e);
                Some(Self::single(
                    source,
                    header.sequence,
                    ServerCommand::Default(DefaultResponse {
                        command_id: header.command_id,
                        status,
                    }),
                ))
            }
        }
    }

    pub fn handle_command(
        &mut self,
        source: NodeId,
        sequence: u8,
        cmd: ClientCommand,
        now_ms: u64,
    ) -> Option<Reply> {
        let command_id = cmd.command_id();
        let rejected = |status| {
            ServerCommand::Default(DefaultResponse { command_id, status })
        };

        match cmd {
            ClientCommand::QueryNextImage(req) => {
                let rsp = self.query_next_image(source, &req);
                Some(Self::single(source, sequence, ServerCommand::QueryNextImage(rsp)))
            }
            ClientCommand::QuerySpecificFile(req) => {
                let rsp = self.query_specific_file(source, &req);
                Some(Self::single(source, sequence, ServerCommand::QuerySpecificFile(rsp)))
            }
            ClientCommand::ImageBlock(req) => {
                let rsp = match self.image_block(source, &req, now_ms) {
                    Ok(rsp) => ServerCommand::ImageBlock(rsp),
                    Err(status) => rejected(status),
                };
                Some(Self::single(source, sequence, rsp))
            }
            ClientCommand::ImagePage(req) => match self.image_page(source, &req, now_ms) {
                Ok(blocks) => Some(Reply {
                    destination: source,
                    frames: blocks
                        .into_iter()
                        .map(|rsp| ServerCommand::ImageBlock(rsp).to_frame(sequence))
                        .collect(),
                    spacing_ms: req.response_spacing,
                }),
                Err(status) => Some(Self::single(source, sequence, rejected(status))),
            },
            ClientCommand::UpgradeEnd(req) => self
                .upgrade_end(source, &req)
                .map(|rsp| Self::single(source, sequence, rsp)),
        }
    }

    fn single(destination: NodeId, sequence: u8, cmd: ServerCommand) -> Reply {
        Reply {
            destination,
            frames: vec![cmd.to_frame(sequence)],
            spacing_ms: 0,
        }
    }

    pub fn query_next_image(
        &mut self,
        source: NodeId,
        req: &QueryNextImageRequest,
    ) -> QueryImageResponse {
        let current = &req.current;
        let Some(candidate) = self.catalog.search(
            current.manufacturer_id,
            current.image_type_id,
            req.hardware_version,
        ) else {
            log::debug!("No image for {} (running {})", source, current);
            return QueryImageResponse::Unavailable(Status::NoImageAvailable);
        };

        if !self.policy.allow_image(source, current, &candidate) {
            log::info!(
                "Policy {:?} withholds {} from {} (running {})",
                self.policy.next_version(),
                candidate,
                source,
                current
            );
            return QueryImageResponse::Unavailable(Status::NoImageAvailable);
        }

        match self.catalog.header(&candidate) {
            Ok(header) if header.supports_hardware(req.hardware_version) => {
                log::info!("Offering {} to {} (running {})", candidate, source, current);
                QueryImageResponse::Available {
                    image: candidate,
                    image_size: header.image_size,
                }
            }
            Ok(_) => QueryImageResponse::Unavailable(Status::NoImageAvailable),
            Err(e) => {
                log::warn!("Cannot read header of {}: {}", candidate, e);
                QueryImageResponse::Unavailable(Status::NoImageAvailable)
            }
        }
    }

    pub fn query_specific_file(
        &mut self,
        source: NodeId,
        req: &QuerySpecificFileRequest,
    ) -> QueryImageResponse {
        match self.catalog.header(&req.image) {
            Ok(header) => {
                log::info!(
                    "Offering requested file {} to {} ({})",
                    req.image,
                    source,
                    req.requester
                );
                QueryImageResponse::Available {
                    image: header.image_id(),
                    image_size: header.image_size,
                }
            }
            Err(_) => {
                log::debug!("{} asked for {}, not stored", source, req.image);
                QueryImageResponse::Unavailable(Status::NoImageAvailable)
            }
        }
    }

    /// `Err` carries the status of a default response.
    pub fn image_block(
        &mut self,
        source: NodeId,
        req: &ImageBlockRequest,
        now_ms: u64,
    ) -> Result<ImageBlockResponse, Status> {
        if req.max_data_size == 0 {
            return Err(Status::InvalidField);
        }
        if let Some(wait) = self.check_rate(source, req.min_block_period, now_ms) {
            return Ok(wait);
        }
        Ok(self.read_block(source, &req.image, req.offset, req.max_data_size))
    }

    /// Expand a page into block responses, all sent as one reply.
    pub fn image_page(
        &mut self,
        source: NodeId,
        req: &ImagePageRequest,
        now_ms: u64,
    ) -> Result<Vec<ImageBlockResponse>, Status> {
        if !self.policy.accept_page_requests() {
            log::debug!("Page request from {} refused", source);
            return Err(Status::UnsupportedCommand);
        }
        if req.max_data_size == 0 || req.page_size == 0 {
            return Err(Status::InvalidField);
        }

        let end = req.offset as u64 + req.page_size as u64;
        // Blocks are cut to the link budget, so only a read hitting the end
        // of the image comes back shorter than asked
        let block_limit = self.policy.max_block_size(&self.link_for(source));
        let mut offset = req.offset;
        let mut blocks = Vec::new();
        while (offset as u64) < end && blocks.len() < MAX_BLOCKS_PER_PAGE {
            // A page never stalls: a deferral ends it with what was produced
            if let Some(wait) = self.check_rate(source, None, now_ms) {
                if blocks.is_empty() {
                    blocks.push(wait);
                } else {
                    log::info!("Page for {} cut short at offset {}", source, offset);
                }
                break;
            }

            let left = (end - offset as u64).min(u8::MAX as u64) as u8;
            let want = req.max_data_size.min(block_limit).min(left);
            let rsp = self.read_block(source, &req.image, offset, want);
            match &rsp {
                ImageBlockResponse::Data { data, .. } => {
                    let sent = data.len() as u32;
                    let short = sent < want as u32;
                    blocks.push(rsp);
                    offset += sent;
                    if short {
                        break;
                    }
                }
                _ => {
                    if blocks.is_empty() {
                        blocks.push(rsp);
                    }
                    break;
                }
            }
        }
        log::debug!(
            "Page for {} at {}: {} blocks, {} ms apart",
            source,
            req.offset,
            blocks.len(),
            req.response_spacing
        );
        Ok(blocks)
    }

    /// `None` when nothing goes back to the node.
    pub fn upgrade_end(&mut self, source: NodeId, req: &UpgradeEndRequest) -> Option<ServerCommand> {
        self.clients.remove(source);
        if matches!(self.last_transfer, Some((_, node)) if node == source) {
            self.last_transfer = None;
        }

        if req.status != Status::Success {
            log::warn!(
                "{} failed to install {}: {:?}",
                source,
                req.image,
                req.status
            );
            return None;
        }

        let upgrade_time = match self.policy.upgrade_end(source, &req.image) {
            UpgradeDisposition::Now => 0,
            UpgradeDisposition::Soon => self.policy.upgrade_soon_delay_secs(),
            UpgradeDisposition::AskLater => UPGRADE_TIME_WAIT_FOREVER,
            UpgradeDisposition::Abort => {
                log::info!("Aborting upgrade of {} to {}", source, req.image);
                return Some(ServerCommand::Default(DefaultResponse {
                    command_id: command::UPGRADE_END_REQUEST,
                    status: Status::Abort,
                }));
            }
        };
        log::info!(
            "{} finished {}, upgrade in {}",
            source,
            req.image,
            if upgrade_time == UPGRADE_TIME_WAIT_FOREVER {
                "(wait)".to_string()
            } else {
                format!("{} s", upgrade_time)
            }
        );
        // Current time zero makes the upgrade time relative
        Some(ServerCommand::UpgradeEnd(UpgradeEndResponse {
            image: req.image,
            current_time: 0,
            upgrade_time,
        }))
    }

    /// `Some` when the node has to wait instead of getting data.
    fn check_rate(
        &mut self,
        source: NodeId,
        client_period: Option<u16>,
        now_ms: u64,
    ) -> Option<ImageBlockResponse> {
        let current_time = (now_ms / 1000) as u32;
        let period = self.policy.block_period();
        let retry = self.policy.busy_retry_secs();
        let wait = |delay: u32, min_block_period: u16| ImageBlockResponse::WaitForData {
            current_time,
            request_time: current_time.saturating_add(delay),
            min_block_period,
        };

        if self.over_capacity {
            log::debug!("Busy, deferring {} for {} s", source, retry);
            return Some(wait(retry, period.value));
        }
        let Some(state) = self.clients.admit(source, now_ms) else {
            return Some(wait(retry, period.value));
        };

        // Nodes that do not report a period are served as they come
        let client_period = client_period?;
        if period.is_disabled() {
            return None;
        }

        let expected = match period.units {
            PeriodUnits::Milliseconds | PeriodUnits::Seconds => period.value,
            PeriodUnits::Discover => match state.finish_discovery(now_ms, UNITS_DISCOVERY_PERIOD) {
                ClientUnits::Unknown => {
                    state.discovery_sent_ms = Some(now_ms);
                    state.negotiated_period = Some(UNITS_DISCOVERY_PERIOD);
                    log::debug!("Discovering block period units of {}", source);
                    return Some(wait(0, UNITS_DISCOVERY_PERIOD));
                }
                ClientUnits::Seconds => period.in_seconds(),
                ClientUnits::Milliseconds => period.value,
            },
        };

        state.negotiated_period = Some(expected);
        if client_period != expected {
            log::info!(
                "{} uses block period {}, asking for {} ({:?})",
                source,
                client_period,
                expected,
                state.units
            );
            return Some(wait(0, expected));
        }
        None
    }

    fn read_block(
        &mut self,
        source: NodeId,
        image: &ImageId,
        offset: u32,
        max_data_size: u8,
    ) -> ImageBlockResponse {
        let limit = self.policy.max_block_size(&self.link_for(source));
        if limit == 0 {
            log::warn!("Link to {} has no room for image data", source);
            return ImageBlockResponse::Status(Status::Abort);
        }
        let size = max_data_size.min(limit);

        match self.catalog.read_bytes(image, offset, size as u32) {
            Ok(data) if !data.is_empty() => {
                self.note_transfer(source, image, offset);
                ImageBlockResponse::Data {
                    image: *image,
                    offset,
                    data,
                }
            }
            Ok(_) => {
                log::debug!("{} asked for {} past its end ({})", source, image, offset);
                ImageBlockResponse::Status(Status::NoImageAvailable)
            }
            Err(e) => {
                log::debug!("Block of {} for {} unavailable: {}", image, source, e);
                ImageBlockResponse::Status(Status::NoImageAvailable)
            }
        }
    }

    fn note_transfer(&mut self, source: NodeId, image: &ImageId, offset: u32) {
        let image = ImageId::new(
            image.manufacturer_id,
            image.image_type_id,
            image.firmware_version,
        );
        if self.last_transfer != Some((image, source)) {
            log::info!("Sending {} to {} from offset {}", image, source, offset);
            self.last_transfer = Some((image, source));
        }
        if let Some(state) = self.clients.get_mut(source) {
            if state.last_seen_offset == Some(offset) {
                log::debug!("{} repeated request for offset {}", source, offset);
            }
            state.last_seen_offset = Some(offset);
        }
    }
}
