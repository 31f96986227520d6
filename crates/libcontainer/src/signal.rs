//! Signal names accepted by `kill` and `instance stop`.

use std::convert::TryFrom;
use std::fmt;

use nix::sys::signal::Signal as NixSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal(NixSignal);

#[derive(Debug, thiserror::Error)]
pub enum SignalError<T> {
    #[error("invalid signal: {0}")]
    InvalidSignal(T),
}

impl Default for Signal {
    fn default() -> Self {
        Signal(NixSignal::SIGTERM)
    }
}

impl TryFrom<&str> for Signal {
    type Error = SignalError<String>;

    /// Accepts a number, a bare name or a `SIG` prefixed name in any case.
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let upper = s.trim().to_ascii_uppercase();
        if let Ok(num) = upper.parse::<i32>() {
            return NixSignal::try_from(num)
                .map(Signal)
                .map_err(|_| SignalError::InvalidSignal(s.to_string()));
        }
        let name = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        let name = match name.as_str() {
            "SIGIOT" => "SIGABRT",
            "SIGCLD" => "SIGCHLD",
            "SIGPOLL" => "SIGIO",
            other => other,
        };
        name.parse::<NixSignal>()
            .map(Signal)
            .map_err(|_| SignalError::InvalidSignal(s.to_string()))
    }
}

impl TryFrom<i32> for Signal {
    type Error = SignalError<i32>;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        NixSignal::try_from(value)
            .map_err(|_| SignalError::InvalidSignal(value))
            .map(Signal)
    }
}

impl From<NixSignal> for Signal {
    fn from(s: NixSignal) -> Self {
        Signal(s)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl Signal {
    pub fn into_raw(self) -> NixSignal {
        self.0
    }
}
