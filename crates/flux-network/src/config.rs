//! Immutable proxy configuration, shared (by reference) across every
//! connection context for the process lifetime.

/// Diagnostic verbosity, mapped onto `tracing` levels by the binary crate.
/// Five levels, matching the original's `error`/`warning`/`info`/`debug`/
/// `I/O`: `Io` is strictly noisier than `Debug` and is reserved for
/// per-byte wire tracing at the `Endpoint::recv`/`send` call sites, kept
/// distinct from general `debug!` logging so it can be enabled on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Io,
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Io => "trace",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

/// Bind/upstream addressing and per-side encryption flags, fixed at
/// startup and read-only for the lifetime of the process.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub bind_port: u16,
    pub upstream_addr: String,
    pub upstream_port: u16,
    /// Encrypt the client-facing (downstream) side.
    pub encrypt_downstream: bool,
    /// Encrypt the server-facing (upstream) side.
    pub encrypt_upstream: bool,
    pub log_level: LogLevel,
}

impl Config {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bind_addr: impl Into<String>,
        bind_port: u16,
        upstream_addr: impl Into<String>,
        upstream_port: u16,
        encrypt_downstream: bool,
        encrypt_upstream: bool,
        log_level: LogLevel,
    ) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            bind_port,
            upstream_addr: upstream_addr.into(),
            upstream_port,
            encrypt_downstream,
            encrypt_upstream,
            log_level,
        }
    }
}
