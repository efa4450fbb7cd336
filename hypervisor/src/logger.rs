//! Serial port logging.
//!
//! The kernel logger is unusable once the processor runs under a hypervisor, so output goes
//! straight to a COM port, which VMware Workstation and similar hosts can redirect to a pipe or file.

use log::LevelFilter;

/// COM2.
pub const DEFAULT_PORT: u16 = 0x2f8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggerConfig {
    /// I/O base of the serial port.
    pub port: u16,
    pub level: LevelFilter,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            level: LevelFilter::Info,
        }
    }
}

/// Installs `com_logger` as the global logger. Call once, before any other logging.
pub fn init(config: LoggerConfig) {
    com_logger::builder().base(config.port).filter(config.level).setup();

    log::debug!("Logging to serial port {:#x} at {}", config.port, config.level);
}
