//! Mesh OTA server: image storage backends and the protocol engine that
//! serves images to nodes pulling firmware over a mesh.

pub use ota_core as format;

pub mod config;
pub mod line_io;
pub mod logging;
pub mod ota;
pub mod storage;
pub mod version;
