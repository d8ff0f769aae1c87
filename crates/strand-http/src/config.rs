//! Server configuration
//!
//! Compile-time defaults with runtime environment overrides, highest wins:
//!
//! 1. Builder methods (programmatic)
//! 2. Environment variables
//! 3. Library defaults

use crate::error::ServerError;
use strand_core::env::{env_get, env_get_bool};
use strand_core::{kib, mib};

/// Compile-time defaults.
pub mod defaults {
    use strand_core::{kib, mib};

    /// 0 resolves to the number of CPUs at startup.
    pub const WORKERS: usize = 0;
    pub const BACKLOG: usize = 50;
    pub const LINE_BUFFER_SIZE: usize = kib(8);
    pub const MEM_CONNECTION_MAX: usize = mib(2);
    pub const MEM_HEADERS_MAX: usize = kib(64);
    pub const MEM_CONTENT_MAX: usize = mib(1);
    pub const MEM_TRAILERS_MAX: usize = kib(8);
    pub const MEM_RESPONSE_MAX: usize = mib(1);
    pub const INACTIVITY_TIMEOUT_MS: u64 = 30_000;
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
    pub const KEEPALIVE_IDLE_SECS: i32 = 60;
    pub const KEEPALIVE_COUNT: i32 = 4;
    pub const KEEPALIVE_INTERVAL_SECS: i32 = 15;
    /// Idle plus a full probe cycle, so the kernel gives up no earlier
    /// than keepalive does.
    pub const TCP_USER_TIMEOUT_MS: u32 = 120_000;
    pub const TCP_NODELAY: bool = true;
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: String,
    /// Worker threads; 0 means one per CPU.
    pub workers: usize,
    pub backlog: usize,
    /// Fixed receive buffer per connection; a request line or header block
    /// that never fits in it is a 400.
    pub line_buffer_size: usize,
    /// Hard arena ceiling per connection.
    pub mem_connection_max: usize,
    /// Per-phase ceilings; breaching one forces a 400 + close.
    pub mem_headers_max: usize,
    pub mem_content_max: usize,
    pub mem_trailers_max: usize,
    pub mem_response_max: usize,
    pub inactivity_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub keepalive_idle_secs: i32,
    pub keepalive_count: i32,
    pub keepalive_interval_secs: i32,
    pub tcp_user_timeout_ms: u32,
    pub tcp_nodelay: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerOptions {
    /// Library defaults, no environment override.
    pub fn new() -> Self {
        Self {
            host: String::from("0.0.0.0"),
            port: String::from("8080"),
            workers: defaults::WORKERS,
            backlog: defaults::BACKLOG,
            line_buffer_size: defaults::LINE_BUFFER_SIZE,
            mem_connection_max: defaults::MEM_CONNECTION_MAX,
            mem_headers_max: defaults::MEM_HEADERS_MAX,
            mem_content_max: defaults::MEM_CONTENT_MAX,
            mem_trailers_max: defaults::MEM_TRAILERS_MAX,
            mem_response_max: defaults::MEM_RESPONSE_MAX,
            inactivity_timeout_ms: defaults::INACTIVITY_TIMEOUT_MS,
            shutdown_timeout_ms: defaults::SHUTDOWN_TIMEOUT_MS,
            keepalive_idle_secs: defaults::KEEPALIVE_IDLE_SECS,
            keepalive_count: defaults::KEEPALIVE_COUNT,
            keepalive_interval_secs: defaults::KEEPALIVE_INTERVAL_SECS,
            tcp_user_timeout_ms: defaults::TCP_USER_TIMEOUT_MS,
            tcp_nodelay: defaults::TCP_NODELAY,
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `STRAND_HTTP_HOST` / `STRAND_HTTP_PORT`
    /// - `STRAND_HTTP_WORKERS` - worker threads (0 = CPU count)
    /// - `STRAND_HTTP_BACKLOG`
    /// - `STRAND_HTTP_LINE_BUFFER` - receive buffer bytes
    /// - `STRAND_HTTP_MEM_CONNECTION` - per-connection arena ceiling
    /// - `STRAND_HTTP_MEM_HEADERS` / `_MEM_CONTENT` / `_MEM_TRAILERS` /
    ///   `_MEM_RESPONSE` - per-phase ceilings
    /// - `STRAND_HTTP_INACTIVITY_TIMEOUT_MS` / `STRAND_HTTP_SHUTDOWN_TIMEOUT_MS`
    /// - `STRAND_HTTP_KEEPALIVE_IDLE` / `_KEEPALIVE_COUNT` / `_KEEPALIVE_INTERVAL`
    /// - `STRAND_HTTP_USER_TIMEOUT_MS` / `STRAND_HTTP_NODELAY`
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            host: std::env::var("STRAND_HTTP_HOST").unwrap_or(base.host),
            port: std::env::var("STRAND_HTTP_PORT").unwrap_or(base.port),
            workers: env_get("STRAND_HTTP_WORKERS", base.workers),
            backlog: env_get("STRAND_HTTP_BACKLOG", base.backlog),
            line_buffer_size: env_get("STRAND_HTTP_LINE_BUFFER", base.line_buffer_size),
            mem_connection_max: env_get("STRAND_HTTP_MEM_CONNECTION", base.mem_connection_max),
            mem_headers_max: env_get("STRAND_HTTP_MEM_HEADERS", base.mem_headers_max),
            mem_content_max: env_get("STRAND_HTTP_MEM_CONTENT", base.mem_content_max),
            mem_trailers_max: env_get("STRAND_HTTP_MEM_TRAILERS", base.mem_trailers_max),
            mem_response_max: env_get("STRAND_HTTP_MEM_RESPONSE", base.mem_response_max),
            inactivity_timeout_ms: env_get(
                "STRAND_HTTP_INACTIVITY_TIMEOUT_MS",
                base.inactivity_timeout_ms,
            ),
            shutdown_timeout_ms: env_get(
                "STRAND_HTTP_SHUTDOWN_TIMEOUT_MS",
                base.shutdown_timeout_ms,
            ),
            keepalive_idle_secs: env_get("STRAND_HTTP_KEEPALIVE_IDLE", base.keepalive_idle_secs),
            keepalive_count: env_get("STRAND_HTTP_KEEPALIVE_COUNT", base.keepalive_count),
            keepalive_interval_secs: env_get(
                "STRAND_HTTP_KEEPALIVE_INTERVAL",
                base.keepalive_interval_secs,
            ),
            tcp_user_timeout_ms: env_get("STRAND_HTTP_USER_TIMEOUT_MS", base.tcp_user_timeout_ms),
            tcp_nodelay: env_get_bool("STRAND_HTTP_NODELAY", base.tcp_nodelay),
        }
    }

    // Builder methods

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: &str) -> Self {
        self.port = port.to_string();
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn line_buffer_size(mut self, bytes: usize) -> Self {
        self.line_buffer_size = bytes;
        self
    }

    pub fn mem_connection_max(mut self, bytes: usize) -> Self {
        self.mem_connection_max = bytes;
        self
    }

    pub fn inactivity_timeout_ms(mut self, ms: u64) -> Self {
        self.inactivity_timeout_ms = ms;
        self
    }

    /// Worker count with 0 resolved to the CPU count.
    pub fn effective_workers(&self) -> usize {
        if self.workers != 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.port.is_empty() {
            return Err(ServerError::InvalidOptions("port must be set".into()));
        }
        if self.line_buffer_size < kib(1) {
            return Err(ServerError::InvalidOptions(
                "line buffer must be at least 1 KiB".into(),
            ));
        }
        if self.mem_connection_max < self.line_buffer_size + kib(4) {
            return Err(ServerError::InvalidOptions(
                "connection ceiling must exceed the line buffer plus bookkeeping".into(),
            ));
        }
        if self.mem_connection_max > mib(1024) {
            return Err(ServerError::InvalidOptions(
                "connection ceiling above 1 GiB is almost certainly a typo".into(),
            ));
        }
        Ok(())
    }
}
