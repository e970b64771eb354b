//! Signal name parsing.

use std::str::FromStr;

use nix::sys::signal::Signal;
use tracing::warn;

/// Signal used when a caller names none, or names one we don't know.
pub const DEFAULT_SIGNAL: Signal = Signal::SIGINT;

/// Parse a signal name such as `SIGTERM`, `sigterm` or `TERM`.
pub fn parse_signal(name: &str) -> Option<Signal> {
    let name = name.trim().to_ascii_uppercase();
    if name.is_empty() {
        return None;
    }
    if name.starts_with("SIG") {
        Signal::from_str(&name).ok()
    } else {
        Signal::from_str(&format!("SIG{name}")).ok()
    }
}

/// Parse `name`, falling back to [`DEFAULT_SIGNAL`] when it is empty or
/// unknown.
pub fn signal_or_default(name: &str) -> Signal {
    if name.trim().is_empty() {
        return DEFAULT_SIGNAL;
    }
    parse_signal(name).unwrap_or_else(|| {
        warn!(signal = %name, fallback = %DEFAULT_SIGNAL, "Unknown signal, using fallback");
        DEFAULT_SIGNAL
    })
}
