//! wsgate-core: building blocks for the WebSocket-to-TCP gateway.
//!
//! Provides bearer-token verification, the static destination map,
//! wire-level traffic capture and the shared error types.

pub mod dump;
pub mod error;
pub mod mapping;
pub mod token;

// Re-export commonly used items at crate root.
pub use dump::{render_hex_dump, Capture, CaptureLevel, Direction, DumpBuffer, HexDump};
pub use error::{AuthError, GateError, GateResult, KeyError, MappingError};
pub use mapping::Mapping;
pub use token::TokenVerifier;
