// Image verification - cooperative, a bounded amount of hashing per step

use ota_core::tag::TAG_HEADER_LENGTH;
use ota_core::{find_tag, read_tag_data, ImageBuilder, ImageId, TagId, TagInfo};
use sha2::{Digest, Sha256};

use crate::storage::{CatalogTagSource, ImageCatalog};

pub const SHA256_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    InProgress,
    Pass,
    Fail,
}

/// Checks a stored image. `step` is called repeatedly from the scheduler
/// until it stops returning `InProgress`.
pub trait ImageVerifier {
    fn begin(&mut self, image: ImageId);

    fn step(&mut self, catalog: &dyn ImageCatalog) -> VerifyStatus;
}

struct HashRun {
    image: ImageId,
    digest_tag: TagInfo,
    hasher: Sha256,
    position: u32,
}

/// Verifies the SHA-256 digest carried in the manufacturer tag 0xF100,
/// which covers every byte before the tag record and must close the image.
pub struct Sha256Verifier {
    bytes_per_step: u32,
    pending: Option<ImageId>,
    run: Option<HashRun>,
    outcome: Option<VerifyStatus>,
}

impl Sha256Verifier {
    pub fn new(bytes_per_step: u32) -> Self {
        Self {
            bytes_per_step: bytes_per_step.max(1),
            pending: None,
            run: None,
            outcome: None,
        }
    }

    fn fail(&mut self, image: &ImageId, reason: &str) -> VerifyStatus {
        log::warn!("Image {} failed verification: {}", image, reason);
        self.run = None;
        self.outcome = Some(VerifyStatus::Fail);
        VerifyStatus::Fail
    }

    fn start_run(&mut self, image: ImageId, catalog: &dyn ImageCatalog) -> VerifyStatus {
        let header = match catalog.header(&image) {
            Ok(header) => header,
            Err(e) => return self.fail(&image, &e.to_string()),
        };
        let source = CatalogTagSource::new(catalog, image);
        let digest_tag = match find_tag(&source, &header, TagId::SHA256_DIGEST) {
            Ok(tag) => tag,
            Err(e) => return self.fail(&image, &e.to_string()),
        };
        if digest_tag.length as usize != SHA256_LENGTH {
            return self.fail(&image, "digest tag has the wrong length");
        }
        if digest_tag.end() != header.image_size {
            return self.fail(&image, "data follows the digest tag");
        }
        log::debug!(
            "Verifying {}: hashing {} bytes",
            image,
            digest_tag.record_offset()
        );
        self.run = Some(HashRun {
            image,
            digest_tag,
            hasher: Sha256::new(),
            position: 0,
        });
        VerifyStatus::InProgress
    }
}

impl ImageVerifier for Sha256Verifier {
    fn begin(&mut self, image: ImageId) {
        self.pending = Some(image);
        self.run = None;
        self.outcome = None;
    }

    fn step(&mut self, catalog: &dyn ImageCatalog) -> VerifyStatus {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        if let Some(image) = self.pending.take() {
            return self.start_run(image, catalog);
        }
        let Some(run) = self.run.as_mut() else {
            return VerifyStatus::Fail;
        };

        let covered = run.digest_tag.record_offset();
        if run.position < covered {
            let want = self.bytes_per_step.min(covered - run.position);
            let chunk = match catalog.read_bytes(&run.image, run.position, want) {
                Ok(chunk) if !chunk.is_empty() => chunk,
                Ok(_) => {
                    let image = run.image;
                    return self.fail(&image, "image shorter than its header says");
                }
                Err(e) => {
                    let image = run.image;
                    return self.fail(&image, &e.to_string());
                }
            };
            run.hasher.update(&chunk);
            run.position += chunk.len() as u32;
            return VerifyStatus::InProgress;
        }

        let Some(run) = self.run.take() else {
            return VerifyStatus::Fail;
        };
        let source = CatalogTagSource::new(catalog, run.image);
        let expected = match read_tag_data(&source, &run.digest_tag) {
            Ok(expected) => expected,
            Err(e) => return self.fail(&run.image, &e.to_string()),
        };
        let actual = run.hasher.finalize();
        if actual.as_slice() != expected.as_slice() {
            return self.fail(&run.image, "digest mismatch");
        }
        log::info!("Image {} verified", run.image);
        self.outcome = Some(VerifyStatus::Pass);
        VerifyStatus::Pass
    }
}

/// Build an image and close it with its SHA-256 digest tag.
pub fn seal_image(builder: ImageBuilder) -> Vec<u8> {
    let mut image = builder
        .tag(TagId::SHA256_DIGEST, vec![0u8; SHA256_LENGTH])
        .build();
    let covered = image.len() - SHA256_LENGTH - TAG_HEADER_LENGTH as usize;
    let digest = Sha256::digest(&image[..covered]);
    let tail = image.len() - SHA256_LENGTH;
    image[tail..].copy_from_slice(&digest);
    image
}
