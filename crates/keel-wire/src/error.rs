//! Error types for wire protocol operations.

use thiserror::Error;

/// Errors returned by transport framing and negotiation.
#[derive(Debug, Error)]
pub enum WireError {
    /// The peer violated the protocol, or sent an error over side-band
    /// channel 3.
    #[error("protocol error during {stage}: {detail}")]
    Protocol {
        /// Which stage of the exchange failed (`"discover"`,
        /// `"negotiate"`, `"receive-pack"`, …).
        stage: &'static str,
        /// What went wrong.
        detail: String,
    },

    /// The operation's abort signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A configured deadline elapsed.
    #[error("timed out waiting for {what}")]
    TimedOut {
        /// What we were waiting on.
        what: &'static str,
    },

    /// A protocol feature this implementation does not speak.
    #[error("unsupported: {what}")]
    Unsupported {
        /// The feature (e.g. `"protocol version 0"`).
        what: String,
    },

    /// Carrier stream failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Shorthand for [`WireError::Protocol`].
    pub fn protocol(stage: &'static str, detail: impl Into<String>) -> Self {
        Self::Protocol { stage, detail: detail.into() }
    }
}
