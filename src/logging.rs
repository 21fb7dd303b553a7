use log::{Level, LevelFilter, Metadata, Record};
use std::io::{IsTerminal, Write};
use std::sync::OnceLock;
use std::time::SystemTime;

static START_TIME: OnceLock<SystemTime> = OnceLock::new();
static USE_COLOR: OnceLock<bool> = OnceLock::new();

mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BRIGHT_RED: &str = "\x1b[91m";
    pub const BRIGHT_YELLOW: &str = "\x1b[93m";
    pub const BRIGHT_GREEN: &str = "\x1b[92m";
    pub const BRIGHT_BLUE: &str = "\x1b[94m";
    pub const GRAY: &str = "\x1b[90m";
}

/// Colored, timestamped lines on stderr. Stdout is left to the frame stream.
struct EnhancedLogger;

/// Time since start, compact enough for a fixed-width column.
fn compact_timestamp(elapsed: std::time::Duration) -> String {
    let seconds = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    if seconds < 60 {
        format!("{:>3}.{:03}s", seconds, millis)
    } else if seconds < 3600 {
        format!("{:>2}m{:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{:>2}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Last path segment of the module, cut to the column width.
fn short_module(path: Option<&str>) -> &str {
    let module = path
        .unwrap_or("unknown")
        .rsplit("::")
        .next()
        .unwrap_or("unknown");
    match module.char_indices().nth(12) {
        Some((cut, _)) => &module[..cut],
        None => module,
    }
}

impl log::Log for EnhancedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let start = START_TIME.get_or_init(SystemTime::now);
        let elapsed = SystemTime::now().duration_since(*start).unwrap_or_default();
        let ts = compact_timestamp(elapsed);

        let (color, level_char) = match record.level() {
            Level::Error => (colors::BRIGHT_RED, 'E'),
            Level::Warn => (colors::BRIGHT_YELLOW, 'W'),
            Level::Info => (colors::BRIGHT_GREEN, 'I'),
            Level::Debug => (colors::BRIGHT_BLUE, 'D'),
            Level::Trace => (colors::GRAY, 'T'),
        };
        let module = short_module(record.module_path());

        let mut err = std::io::stderr().lock();
        // Nothing sensible to do if stderr is gone
        let _ = if *USE_COLOR.get().unwrap_or(&false) {
            writeln!(
                err,
                "{}{} [{}] {:>12} | {}{}",
                color,
                ts,
                level_char,
                module,
                record.args(),
                colors::RESET
            )
        } else {
            writeln!(err, "{} [{}] {:>12} | {}", ts, level_char, module, record.args())
        };
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: EnhancedLogger = EnhancedLogger;

/// Install the logger. Colors are used when stderr is a terminal.
pub fn init_logger(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    let _ = START_TIME.set(SystemTime::now());
    let _ = USE_COLOR.set(std::io::stderr().is_terminal());
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

pub fn parse_level(level: &str) -> Option<LevelFilter> {
    Some(match level.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => return None,
    })
}

/// Parse and set log level from a string; returns true if applied
pub fn set_max_level_from_str(level: &str) -> bool {
    match parse_level(level) {
        Some(filter) => {
            log::set_max_level(filter);
            true
        }
        None => false,
    }
}

pub fn current_max_level() -> LevelFilter {
    log::max_level()
}
