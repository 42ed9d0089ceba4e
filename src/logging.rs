// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! Structured logging setup, following this codebase's `tracing`-based
//! production logging conventions.

use anyhow::Result;
use std::env;
use std::io;
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Output format (json, pretty, compact).
    pub format: LogFormat,
    /// Include source file and line numbers.
    pub include_location: bool,
}

/// Log output format options.
#[derive(Debug, Clone)]
pub enum LogFormat {
    /// JSON format for production logging.
    Json,
    /// Pretty format for development.
    Pretty,
    /// Compact format for space-constrained environments.
    Compact,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Pretty,
            include_location: false,
        }
    }
}

impl LoggingConfig {
    /// Load logging configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let level = env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
        let format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("compact") => LogFormat::Compact,
            _ => LogFormat::Pretty,
        };

        Self {
            include_location: env::var("LOG_INCLUDE_LOCATION").is_ok(),
            level,
            format,
        }
    }

    /// Initialize the global `tracing` subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if a subscriber is already installed.
    pub fn init(&self) -> Result<()> {
        let env_filter = EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);

        match self.format {
            LogFormat::Json => {
                registry
                    .with(
                        fmt::layer()
                            .with_file(self.include_location)
                            .with_line_number(self.include_location)
                            .with_target(true)
                            .with_writer(io::stdout)
                            .with_span_events(FmtSpan::NONE)
                            .json(),
                    )
                    .try_init()?;
            }
            LogFormat::Pretty => {
                registry
                    .with(
                        fmt::layer()
                            .with_file(self.include_location)
                            .with_line_number(self.include_location)
                            .with_target(true)
                            .with_writer(io::stdout)
                            .with_span_events(FmtSpan::NONE),
                    )
                    .try_init()?;
            }
            LogFormat::Compact => {
                registry
                    .with(
                        fmt::layer()
                            .compact()
                            .with_file(false)
                            .with_line_number(false)
                            .with_target(false)
                            .with_writer(io::stdout)
                            .with_span_events(FmtSpan::NONE),
                    )
                    .try_init()?;
            }
        }

        info!(log.level = %self.level, log.format = ?self.format, "fanout-lru-cache logging initialized");
        Ok(())
    }
}

/// Initialize logging with the default configuration.
///
/// # Errors
///
/// Returns an error if a subscriber is already installed.
pub fn init_default() -> Result<()> {
    LoggingConfig::default().init()
}

/// Initialize logging from environment variables.
///
/// # Errors
///
/// Returns an error if a subscriber is already installed.
pub fn init_from_env() -> Result<()> {
    LoggingConfig::from_env().init()
}

/// Domain-specific structured log helpers, analogous to this codebase's
/// `AppLogger`, scoped to cache/invalidation/supervisor events instead of
/// auth/oauth/mcp ones.
pub struct CacheLogger;

impl CacheLogger {
    /// Log a cross-instance invalidation message being applied locally.
    pub fn log_invalidation_applied(cache_id: &str, origin_cache_id: &str, content: &str) {
        info!(
            cache.id = %cache_id,
            origin.cache_id = %origin_cache_id,
            message.content = %content,
            "applied remote invalidation"
        );
    }

    /// Log a supervisor state transition.
    pub fn log_supervisor_transition(from: &str, to: &str, attempt: u32) {
        info!(
            supervisor.from = %from,
            supervisor.to = %to,
            supervisor.attempt = %attempt,
            "supervisor state transition"
        );
    }

    /// Log request coalescing: a caller joined an already in-flight load for `key`.
    pub fn log_coalesced_load(key: &str, joined: usize) {
        info!(cache.key = %key, coalesced.joined = %joined, "load coalesced");
    }
}
