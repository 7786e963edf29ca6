//! Container-runtime failures, classified so the orchestrator can tell
//! infrastructure faults apart from user-code outcomes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Daemon unreachable or connection dropped
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("image '{0}' not found")]
    ImageMissing(String),

    #[error("failed to mount staged files: {0}")]
    Mount(String),

    /// The daemon answered with a server-side fault
    #[error("container runtime fault: {0}")]
    Runtime(String),

    /// The daemon refused the request as malformed
    #[error("request rejected by container runtime: {0}")]
    Rejected(String),

    #[error("invalid resource policy: {0}")]
    Policy(String),
}

impl EngineError {
    /// Worth another attempt: the same request may succeed once the daemon recovers
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Unavailable(_) | EngineError::Runtime(_))
    }

    /// Map a bollard error onto the taxonomy. `subject` names the image or
    /// container the call was about.
    pub fn from_docker(err: bollard::errors::Error, subject: &str) -> Self {
        use bollard::errors::Error as DockerError;
        match err {
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } => {
                if message.contains("bind source path does not exist")
                    || message.contains("invalid mount config")
                {
                    EngineError::Mount(message)
                } else if status_code == 404
                    && (message.contains("No such image") || message.contains("not found"))
                {
                    EngineError::ImageMissing(subject.to_string())
                } else if status_code >= 500 {
                    EngineError::Runtime(message)
                } else {
                    EngineError::Rejected(message)
                }
            }
            other => EngineError::Unavailable(other.to_string()),
        }
    }
}
