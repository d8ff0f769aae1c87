//! # strand-http
//!
//! Incremental HTTP/1.1 server stack: a wire codec (request line, header
//! fields, chunked framing, response serialization), a per-connection state
//! machine with per-phase memory accounting, a segment-trie router and a
//! worker-pool server running on the strand-runtime scheduler.
//!
//! Each connection owns one arena; every request epoch frees it back to the
//! post-accept marker, so pipelined requests never accumulate memory.

pub mod chars;
pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod router;
pub mod server;
pub mod tcp;
pub mod uri;

pub use codec::{Method, Request, Response, Version};
pub use config::ServerOptions;
pub use error::{HttpError, ServerError};
pub use router::{Handler, Route, Router};
pub use server::serve;
