//! Error type shared by the ports that talk to the remote sync server.

use super::define_port_error;

define_port_error! {
    /// Failures of one remote call, classified by what the caller can do next.
    pub enum RemoteCallError {
        /// No bearer token was available or the server rejected it.
        Unauthorized { message: String } =>
            "remote rejected credentials: {message}" as Unauthorized,
        /// Authenticated, but the server denied access.
        Forbidden { message: String } =>
            "remote denied access: {message}" as Unauthorized,
        /// The addressed resource does not exist.
        NotFound { message: String } =>
            "remote resource not found: {message}" as Unreachable,
        /// The call did not finish in time.
        Timeout { message: String } =>
            "remote call timed out: {message}" as Unreachable,
        /// The connection failed before a response arrived.
        Transport { message: String } =>
            "remote transport failed: {message}" as Unreachable,
        /// The server answered with an unexpected status.
        Status { status: u16, message: String } =>
            "remote returned status {status}: {message}" as Unreachable,
        /// The response body could not be decoded.
        Decode { message: String } =>
            "remote response decode failed: {message}" as Unreachable,
    }
}

impl RemoteCallError {
    /// Whether the failure is an authorisation problem rather than a
    /// connectivity one.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::Forbidden { .. })
    }

    /// Whether the remote could not be reached or answered with a server error.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
