use std::result;

use thiserror::Error;

/// Errors surfaced by the array model, the tile cache and the protocol client.
///
/// The error is `Clone` so that the outcome of a single remote fetch can be handed, unchanged, to
/// every caller waiting on the same tile.
///
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    /// The session could not be established: unreachable host or rejected credentials.
    #[error("cannot connect to {host}: {message}")]
    Connection { host: String, message: String },

    /// The remote speaks a protocol revision this client does not know.
    #[error("unsupported protocol version: {0}")]
    ProtocolVersion(String),

    /// The remote rejected or failed to execute a query. The message is the remote's, verbatim.
    #[error("query failed: {message} (query: {query})")]
    Query { message: String, query: String },

    /// The connection failed mid-operation, or timed out.
    #[error("transport error: {0}")]
    Transport(String),

    /// The requested array or tile holds no data.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("affine transform is not invertible (determinant {0})")]
    SingularTransform(f64),

    #[error("array {array} has no attribute named {name}")]
    UnknownAttribute { array: String, name: String },

    #[error("array {array} has no dimension named {name}")]
    UnknownDimension { array: String, name: String },

    /// A spatial or temporal accessor was used on an array lacking that reference.
    #[error("array {array} has no {capability} reference")]
    CapabilityAbsent {
        array: String,
        capability: &'static str,
    },

    /// Writing would push the tile cache past its hard ceiling while dirty tiles cannot be flushed.
    #[error("tile cache full: {resident} bytes resident, hard limit is {limit} bytes")]
    CacheFull { resident: u64, limit: u64 },

    #[error("invalid schema: {0}")]
    Schema(String),

    #[error("cannot decode tile payload: {0}")]
    Decode(String),

    #[error("cannot parse {what}: {input:?}")]
    Parse { what: &'static str, input: String },

    #[error("unsupported attribute type: {0}")]
    UnsupportedType(String),
}

impl Error {
    pub(crate) fn parse(what: &'static str, input: impl Into<String>) -> Self {
        Self::Parse {
            what,
            input: input.into(),
        }
    }

    pub fn query(message: impl Into<String>, query: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            query: query.into(),
        }
    }

    /// No data at this address. A normal outcome for sparse arrays.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the caller may reasonably retry the operation. Only transport failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type Result<T> = result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::NotFound(String::from("a")).is_not_found());
        assert!(!Error::NotFound(String::from("a")).is_retryable());
        assert!(Error::Transport(String::from("reset")).is_retryable());
        assert!(!Error::query("bad", "scan(a)").is_retryable());
    }

    #[test]
    fn test_query_error_keeps_message_verbatim() {
        let err = Error::query("SCIDB_LE_ARRAY_DOESNT_EXIST", "scan(nope)");
        assert_eq!(
            err.to_string(),
            "query failed: SCIDB_LE_ARRAY_DOESNT_EXIST (query: scan(nope))"
        );
    }
}
