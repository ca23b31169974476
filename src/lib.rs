pub mod client;
pub mod disk;
pub mod eloop;
pub mod executor;
pub mod mem;
pub mod net;
pub mod resp;
pub mod server;

/// Errors that are fatal to the server process. Connection-level failures
/// never reach this type; they are settled inside the event loop by closing
/// the offending client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
