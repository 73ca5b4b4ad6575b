use std::io;

use thiserror::Error;

use super::Transport;

/// Failures of the mapping engine. `Bind`, `Duplicate` and `NotFound` are
/// returned synchronously from add/delete; the rest occur inside relay tasks
/// and are only ever logged.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("failed to bind {transport} listener on {addr}: {source}")]
    Bind {
        transport: Transport,
        addr: String,
        source: io::Error,
    },

    #[error("a {transport} mapping for {addr} already exists")]
    Duplicate { transport: Transport, addr: String },

    #[error("no {transport} mapping for {addr}")]
    NotFound { transport: Transport, addr: String },

    #[error("cannot resolve forward address '{addr}'")]
    Resolve { addr: String },

    #[error("failed to dial {addr}: {source}")]
    Dial { addr: String, source: io::Error },

    #[error("relay failed: {source}")]
    Relay {
        #[from]
        source: io::Error,
    },
}
