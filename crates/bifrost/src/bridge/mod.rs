//! Wire layer between the host and the companion process.
//!
//! # Architecture
//!
//! - **protocol**: Dispatch request, companion output messages, line classification
//! - **codec**: Hex length-prefixed JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
