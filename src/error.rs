//! Contains the `Error` and `Result` types that `mongodb_sdam` uses.

use std::{collections::HashSet, fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const NOT_PRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];

/// The result type for all methods that can return an error in the `mongodb_sdam` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongodb_sdam` crate. The inner [`ErrorKind`] is wrapped in an
/// `Arc` to allow the errors to be cloned.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Arc<ErrorKind>,
    labels: HashSet<String>,
}

impl Error {
    /// Creates an `InvalidArgument` error with the given message.
    pub fn invalid_argument(message: impl AsRef<str>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.as_ref().to_string(),
        }
        .into()
    }

    /// Creates an `Internal` error with the given message.
    pub(crate) fn internal(message: impl AsRef<str>) -> Self {
        ErrorKind::Internal {
            message: message.as_ref().to_string(),
        }
        .into()
    }

    /// Creates a `Network` error with the given message, as reported by the heartbeat transport
    /// or an operation layer.
    pub fn network(message: impl AsRef<str>) -> Self {
        ErrorKind::Network {
            message: message.as_ref().to_string(),
            timed_out: false,
        }
        .into()
    }

    /// Creates a `Network` error representing a timed-out operation.
    pub fn network_timeout(message: impl AsRef<str>) -> Self {
        ErrorKind::Network {
            message: message.as_ref().to_string(),
            timed_out: true,
        }
        .into()
    }

    pub(crate) fn server_selection(message: impl AsRef<str>) -> Self {
        ErrorKind::ServerSelection {
            message: message.as_ref().to_string(),
        }
        .into()
    }

    /// Whether this error is a network error, including network timeouts.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Network { .. } | ErrorKind::Io(..)
        )
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        match self.kind.as_ref() {
            ErrorKind::Network { timed_out, .. } => *timed_out,
            ErrorKind::Io(ref io_err) => io_err.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Whether this error is a network error that is not a timeout. Per the SDAM spec, these
    /// immediately mark the originating server Unknown, whereas timeouts during operation
    /// execution do not.
    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        self.is_network_error() && !self.is_network_timeout()
    }

    /// Whether this error is a "node is recovering" or "not primary" error, which indicates the
    /// server's view of the replica set changed and our description of it is stale.
    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_not_primary()
    }

    /// Gets the code/message tuple from this error, if applicable.
    fn code_and_message(&self) -> Option<(i32, &str)> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref cmd_err) => Some((cmd_err.code, cmd_err.message.as_str())),
            _ => None,
        }
    }

    /// If this error corresponds to a "not primary" error as per the SDAM spec.
    pub(crate) fn is_not_primary(&self) -> bool {
        self.code_and_message()
            .map(|(code, msg)| is_not_primary(code, msg))
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is recovering" error as per the SDAM spec.
    pub(crate) fn is_recovering(&self) -> bool {
        self.code_and_message()
            .map(|(code, msg)| is_recovering(code, msg))
            .unwrap_or(false)
    }

    /// The `topologyVersion` the server attached to this error, if any. State-change errors
    /// carry one so that stale errors can be discarded the same way stale hello replies are.
    pub(crate) fn topology_version(&self) -> Option<crate::hello::TopologyVersion> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref cmd_err) => cmd_err.topology_version,
            _ => None,
        }
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        let kind: ErrorKind = err.into();
        let labels = match &kind {
            ErrorKind::Command(cmd_err) => cmd_err.labels.iter().cloned().collect(),
            _ => HashSet::new(),
        };
        Self {
            kind: Arc::new(kind),
            labels,
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// The server returned an error to an attempted command.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// An error occurred during DNS resolution.
    #[error("An error occurred during DNS resolution: {message}")]
    #[non_exhaustive]
    DnsResolve { message: String },

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// A heartbeat or operation failed to send or receive a reply over the network.
    #[error("A network error occurred: {message}")]
    #[non_exhaustive]
    Network { message: String, timed_out: bool },

    /// The server returned an invalid reply.
    #[error("The server returned an invalid reply: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// No server was able to be selected for the operation within the timeout.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// The topology was shut down while the operation was in progress.
    #[error("The topology for this client has been shut down")]
    #[non_exhaustive]
    Shutdown,

    /// The deployment is not compatible with this version of the driver.
    #[error("{message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },
}

fn is_not_primary(code: i32, message: &str) -> bool {
    if NOT_PRIMARY_CODES.contains(&code) {
        return true;
    }
    if is_recovering(code, message) {
        return false;
    }
    message.contains("not master")
}

fn is_recovering(code: i32, message: &str) -> bool {
    if RECOVERING_CODES.contains(&code) {
        return true;
    }
    message.contains("not master or secondary") || message.contains("node is recovering")
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,

    /// The error labels that the server returned.
    #[serde(rename = "errorLabels", default)]
    pub labels: Vec<String>,

    /// The `topologyVersion` reported by the server alongside the error.
    #[serde(rename = "topologyVersion", default)]
    pub topology_version: Option<crate::hello::TopologyVersion>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "({}): {}", self.code_name, self.message)
    }
}
