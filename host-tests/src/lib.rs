//! Host-based scenario tests for the mesh OTA server
//! These drive the server through encoded frames, the way a node would.

#[cfg(test)]
mod tests {
    use mesh_ota::format::{
        HardwareVersions, Header, ImageBuilder, ImageId, TagId, MAX_HEADER_LENGTH,
    };
    use mesh_ota::ota::verify::seal_image;
    use mesh_ota::ota::wire::{
        parse_server_frame, ClientCommand, ImageBlockRequest, ImageBlockResponse,
        ImagePageRequest, QueryImageResponse, QueryNextImageRequest, ServerCommand, Status,
        UpgradeEndRequest,
    };
    use mesh_ota::ota::{
        ImageVerifier, LinkConfig, NextVersionPolicy, NodeId, OtaServer, PolicyConfig,
        Sha256Verifier, VerifyStatus,
    };
    use mesh_ota::storage::{
        DirectoryStore, FlashDevice, ImageCatalog, PageEraseLayout, PageEraseStore, RamFlash,
        SingleSlotStore, StorageError, TempImageStatus,
    };

    const NODE: NodeId = NodeId(0x4F21);
    const MFG: u16 = 0x1002;
    const IMAGE_TYPE: u16 = 0x0031;

    fn firmware(version: u32, payload_len: usize) -> Vec<u8> {
        let mut header = Header::new(MFG, IMAGE_TYPE, version);
        header.set_header_string("scenario image");
        ImageBuilder::new(header)
            .tag(
                TagId::UPGRADE_IMAGE,
                (0..payload_len).map(|i| (i * 7) as u8).collect::<Vec<_>>(),
            )
            .build()
    }

    fn single_slot_with(image: &[u8]) -> SingleSlotStore {
        let mut flash = RamFlash::eeprom(4096);
        flash.write(0, image).unwrap();
        SingleSlotStore::open(flash)
    }

    fn server_for<C: ImageCatalog>(catalog: C, policy: PolicyConfig) -> OtaServer<C> {
        OtaServer::from_config(catalog, &policy, &LinkConfig::default())
    }

    /// Send one client command, return every server command in the reply.
    fn exchange<C: ImageCatalog>(
        server: &mut OtaServer<C>,
        cmd: ClientCommand,
        now_ms: u64,
    ) -> Vec<ServerCommand> {
        let Some(reply) = server.handle_frame(NODE, &cmd.to_frame(0x2A), now_ms) else {
            return Vec::new();
        };
        assert_eq!(reply.destination, NODE);
        reply
            .frames
            .iter()
            .map(|frame| {
                let (header, rsp) = parse_server_frame(frame).unwrap();
                assert_eq!(header.sequence, 0x2A);
                rsp
            })
            .collect()
    }

    fn query(version: u32, hardware_version: Option<u16>) -> ClientCommand {
        ClientCommand::QueryNextImage(QueryNextImageRequest {
            current: ImageId::new(MFG, IMAGE_TYPE, version),
            hardware_version,
        })
    }

    fn offered<C: ImageCatalog>(server: &mut OtaServer<C>, cmd: ClientCommand) -> bool {
        match exchange(server, cmd, 0).as_slice() {
            [ServerCommand::QueryNextImage(QueryImageResponse::Available { .. })] => true,
            [ServerCommand::QueryNextImage(QueryImageResponse::Unavailable(
                Status::NoImageAvailable,
            ))] => false,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn query_next_image_follows_version_policy() {
        // (policy, client version, offered) with the server holding version 5
        let table = [
            (NextVersionPolicy::UpgradeIfNewer, 4, true),
            (NextVersionPolicy::UpgradeIfNewer, 5, false),
            (NextVersionPolicy::UpgradeIfNewer, 6, false),
            (NextVersionPolicy::DowngradeIfOlder, 4, false),
            (NextVersionPolicy::DowngradeIfOlder, 5, false),
            (NextVersionPolicy::DowngradeIfOlder, 6, true),
            (NextVersionPolicy::ReinstallIfSame, 4, false),
            (NextVersionPolicy::ReinstallIfSame, 5, true),
            (NextVersionPolicy::ReinstallIfSame, 6, false),
            (NextVersionPolicy::None, 4, false),
            (NextVersionPolicy::None, 5, false),
            (NextVersionPolicy::None, 6, false),
        ];
        for (next_version, client_version, expected) in table {
            let policy = PolicyConfig {
                next_version,
                ..Default::default()
            };
            let mut server = server_for(single_slot_with(&firmware(5, 64)), policy);
            assert_eq!(
                offered(&mut server, query(client_version, None)),
                expected,
                "{next_version:?} with client at {client_version}"
            );
        }
    }

    #[test]
    fn hardware_version_range_limits_offer() {
        let mut header = Header::new(MFG, IMAGE_TYPE, 9);
        header.hardware_versions = Some(HardwareVersions { min: 2, max: 5 });
        assert_eq!(header.field_control().0, 0x0004);
        let image = ImageBuilder::new(header)
            .tag(TagId::UPGRADE_IMAGE, vec![0xA5; 32])
            .build();

        let mut server = server_for(single_slot_with(&image), PolicyConfig::default());
        assert!(offered(&mut server, query(1, Some(3))));
        assert!(!offered(&mut server, query(1, Some(7))));
        assert!(!offered(&mut server, query(1, Some(1))));
    }

    #[test]
    fn page_request_is_one_reply_of_spaced_blocks() {
        let image = firmware(5, 400);
        let mut server = server_for(single_slot_with(&image), PolicyConfig::default());
        let page = ClientCommand::ImagePage(ImagePageRequest {
            image: ImageId::new(MFG, IMAGE_TYPE, 5),
            offset: 40,
            max_data_size: 40,
            page_size: 200,
            response_spacing: 25,
            requester: None,
        });

        let reply = server
            .handle_frame(NODE, &page.to_frame(7), 0)
            .expect("page reply");
        assert_eq!(reply.spacing_ms, 25);
        assert_eq!(reply.frames.len(), 5);

        let mut offsets = Vec::new();
        for frame in &reply.frames {
            match parse_server_frame(frame).unwrap().1 {
                ServerCommand::ImageBlock(ImageBlockResponse::Data { offset, data, .. }) => {
                    assert_eq!(data.as_slice(), &image[offset as usize..][..40]);
                    offsets.push(offset);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(offsets, vec![40, 80, 120, 160, 200]);
    }

    #[test]
    fn page_with_blocks_above_link_budget_covers_whole_page() {
        let image = firmware(5, 600);
        let mut server = server_for(single_slot_with(&image), PolicyConfig::default());
        let page = ClientCommand::ImagePage(ImagePageRequest {
            image: ImageId::new(MFG, IMAGE_TYPE, 5),
            offset: 0,
            max_data_size: 64,
            page_size: 256,
            response_spacing: 10,
            requester: None,
        });

        let mut covered = 0u32;
        for rsp in exchange(&mut server, page, 0) {
            match rsp {
                ServerCommand::ImageBlock(ImageBlockResponse::Data { offset, data, .. }) => {
                    assert_eq!(offset, covered);
                    assert_eq!(data.as_slice(), &image[offset as usize..][..data.len()]);
                    covered += data.len() as u32;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(covered, 256);
    }

    #[test]
    fn invalidated_single_slot_offers_nothing() {
        let mut store = single_slot_with(&firmware(3, 64));
        assert!(store.search(MFG, IMAGE_TYPE, None).is_some());
        store.invalidate().unwrap();
        assert_eq!(store.search(MFG, IMAGE_TYPE, None), None);
        assert_eq!(store.search(0xFFFF, 0xFFFF, None), None);

        // Same after reopening the device
        let store = SingleSlotStore::open(store.into_device());
        assert_eq!(store.search(MFG, IMAGE_TYPE, None), None);
        let mut server = server_for(store, PolicyConfig::default());
        assert!(!offered(&mut server, query(1, None)));
    }

    fn flash_layout() -> PageEraseLayout {
        PageEraseLayout {
            start_address: 0,
            region_size: 4096,
            reserved_prefix: 0,
            bytemask_address: 4096,
        }
    }

    #[test]
    fn blank_bytemask_means_no_progress() {
        let store = PageEraseStore::open(RamFlash::nor(8192, 256, 2), flash_layout()).unwrap();
        assert_eq!(store.download_state().last_written_offset, 0);
        assert_eq!(store.temp_image_status(), TempImageStatus::Empty);
        assert!(!store.is_full_image_present());
    }

    /// Pull an image block by block the way a node does, persisting into
    /// `node`. Returns the number of block requests sent.
    fn download<S: ImageCatalog, N: ImageCatalog>(
        server: &mut OtaServer<S>,
        node: &mut N,
        image: ImageId,
        size: u32,
    ) -> usize {
        let mut requests = 0;
        let mut offset = node.download_state().last_written_offset;
        while offset < size {
            requests += 1;
            assert!(requests < 1000, "download not converging");
            let req = ClientCommand::ImageBlock(ImageBlockRequest {
                image,
                offset,
                max_data_size: 64,
                requester: None,
                min_block_period: None,
            });
            let data = match exchange(server, req, requests as u64 * 10).as_slice() {
                [ServerCommand::ImageBlock(ImageBlockResponse::Data { data, .. })] => data.clone(),
                other => panic!("unexpected reply {other:?}"),
            };
            let mut polls = 0;
            loop {
                match node.write_bytes(offset, &data) {
                    Ok(()) => break,
                    Err(e) if e.is_retryable() => {
                        polls += 1;
                        assert!(polls < 100, "erase never finished");
                        node.tick();
                    }
                    Err(e) => panic!("write failed: {e}"),
                }
            }
            offset += data.len() as u32;
        }
        requests
    }

    #[test]
    fn directory_server_to_flash_node_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let sealed = seal_image(
            ImageBuilder::new(Header::new(MFG, IMAGE_TYPE, 8))
                .tag(TagId::UPGRADE_IMAGE, vec![0x3C; 900]),
        );
        std::fs::write(dir.path().join("1002-0031-00000008.ota"), &sealed).unwrap();
        std::fs::write(dir.path().join("1002-0031-00000006.ota"), firmware(6, 100)).unwrap();

        let catalog = DirectoryStore::open(dir.path(), 64 * 1024).unwrap();
        let mut server = server_for(catalog, PolicyConfig::default());

        let (image, size) = match exchange(&mut server, query(5, None), 0).as_slice() {
            [ServerCommand::QueryNextImage(QueryImageResponse::Available { image, image_size })] => {
                (*image, *image_size)
            }
            other => panic!("unexpected reply {other:?}"),
        };
        assert_eq!(image, ImageId::new(MFG, IMAGE_TYPE, 8));
        assert_eq!(size as usize, sealed.len());

        let mut node = PageEraseStore::open(RamFlash::nor(8192, 256, 3), flash_layout()).unwrap();
        let block = LinkConfig::default().max_block_size(&LinkConfig::default().default_link());
        let requests = download(&mut server, &mut node, image, size);
        assert_eq!(requests, sealed.len().div_ceil(block as usize));
        assert_eq!(node.finish_download(size).unwrap(), image);

        let mut verifier = Sha256Verifier::new(128);
        verifier.begin(image);
        let mut status = VerifyStatus::InProgress;
        for _ in 0..100 {
            status = verifier.step(&node);
            if status != VerifyStatus::InProgress {
                break;
            }
        }
        assert_eq!(status, VerifyStatus::Pass);
        assert_eq!(server.clients().len(), 1);

        let end = ClientCommand::UpgradeEnd(UpgradeEndRequest {
            status: Status::Success,
            image,
        });
        match exchange(&mut server, end, 20_000).as_slice() {
            [ServerCommand::UpgradeEnd(rsp)] => {
                assert_eq!(rsp.image, image);
                assert_eq!(rsp.upgrade_time, 0);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(server.clients().is_empty());
    }

    #[test]
    fn interrupted_flash_download_resumes_after_restart() {
        let image_bytes = firmware(4, 1500);
        let image = ImageId::new(MFG, IMAGE_TYPE, 4);
        let size = image_bytes.len() as u32;
        let mut server = server_for(single_slot_with(&image_bytes), PolicyConfig::default());

        let mut node = PageEraseStore::open(RamFlash::nor(8192, 256, 1), flash_layout()).unwrap();
        // Half the image, then power goes
        let half = &image_bytes[..800];
        let mut offset = 0u32;
        for chunk in half.chunks(50) {
            loop {
                match node.write_bytes(offset, chunk) {
                    Ok(()) => break,
                    Err(StorageError::EraseInProgress) => node.tick(),
                    Err(e) => panic!("write failed: {e}"),
                }
            }
            offset += chunk.len() as u32;
        }

        let flash = node.into_device().power_cycle();
        let mut node = PageEraseStore::open(flash, flash_layout()).unwrap();
        let resumed = node.download_state().last_written_offset;
        // Only whole pages survive
        assert_eq!(resumed, 768);
        assert!(matches!(node.temp_image_status(), TempImageStatus::Partial(_)));

        download(&mut server, &mut node, image, size);
        assert_eq!(node.finish_download(size).unwrap(), image);
        assert_eq!(
            node.read_bytes(&image, 0, size).unwrap(),
            image_bytes,
            "resumed image differs"
        );
    }

    #[test]
    fn header_fits_every_option_combination() {
        let mut header = Header::new(MFG, IMAGE_TYPE, 1);
        header.security_credentials = Some(1);
        header.hardware_versions = Some(HardwareVersions { min: 0, max: 9 });
        assert!(header.header_length() as usize <= MAX_HEADER_LENGTH);
    }
}
