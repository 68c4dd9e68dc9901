pub mod config;
pub mod error;
pub mod types;

pub use error::{TcfsError, TcfsResult};
pub use types::CodecKind;
