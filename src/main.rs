use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Instant;

use log::{info, warn};

use mesh_ota::config::{self, ServerConfig};
use mesh_ota::line_io::{self, Inbound, BROADCAST};
use mesh_ota::ota::OtaServer;
use mesh_ota::storage::ImageCatalog;
use mesh_ota::{logging, version};

#[derive(Parser)]
#[command(name = "mesh-ota-server")]
#[command(about = "Serve OTA images to mesh nodes over hex frames on stdin/stdout", long_about = None)]
struct Cli {
    /// Server configuration (JSON). Defaults are used if it is missing
    #[arg(value_name = "CONFIG", default_value = "mesh-ota.json")]
    config: PathBuf,

    /// Override the configured log level (off, error, warn, info, debug, trace)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Write the effective configuration back to CONFIG and exit
    #[arg(long)]
    write_config: bool,
}

fn log_catalog(catalog: &dyn ImageCatalog) {
    let info = catalog.info();
    info!(
        "Storage: {} backend, {} image(s), capacity {} bytes",
        info.backend, info.image_count, info.capacity
    );
    for image in catalog.images() {
        match catalog.header(&image) {
            Ok(header) => info!(
                "  {} - {} bytes, stack 0x{:04X}, \"{}\"",
                image,
                header.image_size,
                header.stack_version,
                header.header_string_lossy()
            ),
            Err(e) => warn!("  {} - header unreadable: {}", image, e),
        }
    }
    let temp = catalog.temp_image_status();
    info!("Download slot: {:?}", temp);
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(level) = &cli.log_level {
        if logging::parse_level(level).is_none() {
            bail!("unknown log level '{}'", level);
        }
    }

    logging::init_logger(log::LevelFilter::Info).context("Failed to initialize logger")?;
    info!("Mesh OTA server {}", version::full_version());
    log::debug!("{}", version::version_info());

    let config: ServerConfig = config::load_or_default(&cli.config)?;
    if cli.write_config {
        return config.save(&cli.config);
    }
    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    if !logging::set_max_level_from_str(level) {
        warn!("Unknown log level '{}', keeping {}", level, logging::current_max_level());
    }

    let catalog = config.storage.open()?;
    log_catalog(&*catalog);

    let mut server = OtaServer::from_config(catalog, &config.policy, &config.link);
    let started = Instant::now();
    let stdin = io::stdin();
    let mut out = io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        let now_ms = started.elapsed().as_millis() as u64;
        server.tick(now_ms);

        let inbound = match line_io::parse_line(&line) {
            Ok(Some(inbound)) => inbound,
            Ok(None) => continue,
            Err(e) => {
                warn!("Skipping line '{}': {}", line.trim(), e);
                continue;
            }
        };

        match inbound {
            Inbound::Tick => {}
            Inbound::Notify { image, query_jitter } => {
                let frame = server.image_notify(&image, query_jitter);
                writeln!(out, "{}", line_io::format_frame(BROADCAST, 0, &frame))?;
            }
            Inbound::Frame { source, frame } => {
                if let Some(reply) = server.handle_frame(source, &frame, now_ms) {
                    for text in line_io::format_reply(&reply) {
                        writeln!(out, "{}", text)?;
                    }
                }
            }
        }
        out.flush()?;
    }

    info!("Input closed, {} client(s) still tracked", server.clients().len());
    Ok(())
}
