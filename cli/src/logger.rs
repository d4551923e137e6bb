use std::io::stderr;
use std::sync::OnceLock;

use log::set_logger;
use log::set_max_level;
use log::Level;
use log::LevelFilter;
use log::Log;
use log::Metadata;
use log::Record;
use log::SetLoggerError;

/// Writes everything to stderr so the report and pacman's own output do not
/// interleave badly. Progress messages print bare; diagnostics keep their
/// level prefix.
pub struct Logger;

impl Logger {
    pub fn init(quiet: bool, verbose: u8) -> Result<(), SetLoggerError> {
        let max_level = if quiet {
            LevelFilter::Error
        } else {
            match verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        };
        set_logger(LOGGER.get_or_init(|| Logger)).map(|()| set_max_level(max_level))
    }
}

impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        use std::fmt::Write;
        let mut buffer = String::with_capacity(4096);
        let result = match record.level() {
            Level::Info => writeln!(&mut buffer, "{}", record.args()),
            level => writeln!(&mut buffer, "{level} {}", record.args()),
        };
        if result.is_ok() {
            use std::io::Write;
            let _ = stderr().write_all(buffer.as_bytes());
        }
    }

    fn flush(&self) {
        use std::io::Write;
        let _ = stderr().flush();
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();
