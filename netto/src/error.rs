//! Error taxonomy for the arbitration and monitoring engine.

use std::path::PathBuf;

/// Errors surfaced by the engine.
///
/// `MalformedSample` never leaves the parser; it exists so the parser can
/// report why a line was dropped when tracing is enabled.
#[derive(Debug, thiserror::Error)]
pub enum NettoError {
    /// No registered peer on the decision channel, or it went away mid-request.
    #[error("decision channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// The peer is registered but did not answer in time.
    #[error("no decision received within {0:?}")]
    DecisionTimeout(std::time::Duration),

    /// A feed line did not have the `name.pid,in,out` shape.
    #[error("malformed sample line: {0:?}")]
    MalformedSample(String),

    /// The accounting subprocess could not be started.
    #[error("failed to launch {program}: {source}")]
    ProcessLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The policy file could not be written.
    #[error("failed to persist policies to {path:?}: {message}")]
    Persistence { path: PathBuf, message: String },

    /// The peer sent something that is not a valid frame at this point.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NettoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = NettoError::ChannelUnavailable("not registered".into());
        assert_eq!(err.to_string(), "decision channel unavailable: not registered");

        let err = NettoError::ProcessLaunch {
            program: "/usr/bin/nettop".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().starts_with("failed to launch /usr/bin/nettop"));
    }
}
