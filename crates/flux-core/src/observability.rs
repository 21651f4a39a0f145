//! Leveled logging contract exposed to collaborators.
//!
//! The core itself never talks to a concrete log sink; every module that
//! wants to report something (reduction flushes, reactor stop-with-error,
//! message-channel stalls) goes through [`log`], which maps a seven-level
//! vocabulary onto `tracing`'s five, the same facade shape other crates put
//! in front of their own sink.

/// A seven-level log vocabulary. `Fatal` and `Notice` don't have a direct
/// `tracing::Level` counterpart, so they're carried through as a `level`
/// field on an `error`/`info` event rather than silently collapsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum Level {
    Fatal,
    Error,
    Warn,
    Notice,
    Info,
    Debug,
    Trace,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Fatal => "fatal",
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Notice => "notice",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        }
    }
}

/// Emits one leveled log event. `msg` is a static or owned message; `fields`
/// are `(key, value)` pairs recorded alongside it.
///
/// This is a thin, allocation-light wrapper: when `tracing` has no
/// subscriber installed the call is effectively free (the crate never forces
/// a particular subscriber on its host).
#[cfg(feature = "std")]
pub fn log(level: Level, msg: &str, fields: &[(&str, &str)]) {
    let joined: String = fields
        .iter()
        .map(|(k, v)| format!(" {k}={v}"))
        .collect();
    match level {
        Level::Fatal => tracing::error!(flux.level = "fatal", "{msg}{joined}"),
        Level::Error => tracing::error!("{msg}{joined}"),
        Level::Warn => tracing::warn!("{msg}{joined}"),
        Level::Notice => tracing::info!(flux.level = "notice", "{msg}{joined}"),
        Level::Info => tracing::info!("{msg}{joined}"),
        Level::Debug => tracing::debug!("{msg}{joined}"),
        Level::Trace => tracing::trace!("{msg}{joined}"),
    }
}
