//! Configuration options for ringsock servers and clients.
//!
//! This module provides the knobs a server or client is built with: buffer
//! sizing, listener behavior and logging. A [`Config`] is cloned into each
//! owner at construction, so changing it later never affects a running
//! instance.

use std::path::PathBuf;

use crate::logging::{ConsoleOutput, FileOutput, LogLevel, LogOutput, Logger};

/// Default initial capacity for each per-connection ring buffer (1 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Top-level configuration for a server or client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-connection buffer configuration
    pub buffer: BufferConfig,
    /// Listener configuration (servers only)
    pub listener: ListenerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Per-connection buffer configuration.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Initial capacity of the inbound ring buffer in bytes
    pub rx_initial: usize,
    /// Initial capacity of the outbound ring buffer in bytes
    pub tx_initial: usize,
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Accept backlog (None = system maximum)
    pub backlog: Option<i32>,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,
    /// Minimum log level
    pub level: LogLevel,
    /// Log file path (None = console only)
    pub log_file: Option<PathBuf>,
    /// Use JSON format for logs
    pub json_format: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            rx_initial: DEFAULT_BUFFER_SIZE,
            tx_initial: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self { backlog: None }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: LogLevel::Info,
            log_file: None,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            listener: ListenerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Configuration for development and debugging.
    ///
    /// Enables debug-level console logging.
    pub fn development() -> Self {
        Self {
            logging: LoggingConfig {
                enabled: true,
                level: LogLevel::Debug,
                log_file: None,
                json_format: false,
            },
            ..Self::default()
        }
    }

    /// Configuration with small buffers.
    ///
    /// Useful for memory-constrained deployments and for exercising
    /// backpressure in tests; buffers still grow to one page minimum.
    pub fn small_buffers(size: usize) -> Self {
        Self {
            buffer: BufferConfig {
                rx_initial: size,
                tx_initial: size,
            },
            ..Self::default()
        }
    }

    /// Build the logger described by this configuration.
    pub(crate) fn build_logger(&self) -> Logger {
        if !self.logging.enabled {
            return Logger::disabled();
        }
        let output: Box<dyn LogOutput> = match (&self.logging.log_file, self.logging.json_format) {
            (Some(path), true) => Box::new(FileOutput::new_json(path)),
            (Some(path), false) => Box::new(FileOutput::new(path)),
            (None, true) => Box::new(ConsoleOutput::new_json()),
            (None, false) => Box::new(ConsoleOutput::new()),
        };
        Logger::with_outputs(self.logging.level, vec![output])
    }
}
