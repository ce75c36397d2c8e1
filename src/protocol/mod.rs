//! MPD wire protocol: framing, commands, parsers and the records they produce.

pub mod capabilities;
pub mod commands;
pub mod error;
pub mod parser;
pub mod transport;
pub mod types;

pub use capabilities::ServerCapabilities;
pub use error::{MpdError, MpdResult, ServerError};
pub use parser::Parser;
pub use transport::{Transport, TransportTimeouts};
pub use types::*;
