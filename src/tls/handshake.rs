use crate::tls::error::HandshakeFailure;

/// Where a connection is in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Created, `advance` not yet called.
    NotStarted,
    /// At least one step taken, waiting on the transport.
    InProgress,
    /// Handshake complete. Record I/O is allowed.
    Established,
    /// Handshake abandoned. Terminal.
    Failed,
}

/// What a single call to `advance` achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The transport is not ready. Call `advance` again once it is readable or writable.
    WouldBlock,
    /// The handshake is complete.
    Established,
    /// The handshake failed. Tear the connection down.
    Failed,
}

/// Result of pumping the engine once.
#[derive(Debug)]
pub(crate) enum Step {
    /// The engine needs more input or output capacity than the transport offers right now.
    NeedsIo,
    /// The engine finished the handshake and all handshake output was flushed.
    Complete,
    /// The engine or the transport failed.
    Fatal(HandshakeFailure),
}

impl HandshakeState {
    /// Whether `advance` can still change this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Established | Self::Failed)
    }

    /// The status reported for a connection already in a terminal state.
    pub(crate) const fn settled(self) -> Option<HandshakeStatus> {
        match self {
            Self::Established => Some(HandshakeStatus::Established),
            Self::Failed => Some(HandshakeStatus::Failed),
            Self::NotStarted | Self::InProgress => None,
        }
    }

    /// Applies one engine step. Terminal states ignore further steps.
    pub(crate) fn apply(self, step: &Step) -> (Self, HandshakeStatus) {
        if let Some(status) = self.settled() {
            return (self, status);
        }
        match step {
            Step::NeedsIo => (Self::InProgress, HandshakeStatus::WouldBlock),
            Step::Complete => (Self::Established, HandshakeStatus::Established),
            Step::Fatal(_) => (Self::Failed, HandshakeStatus::Failed),
        }
    }
}
