//! This library implements the HTTP/1.x transaction core of a reverse
//! proxy and load balancer: incremental request and response parsing over
//! ring buffers, header indexing and in-place rewriting, cookie-based
//! server persistence, chunked forwarding, streaming compression, rule
//! evaluation and connection-lifecycle management.
//!
//! The crate deliberately performs no I/O. The embedding proxy owns the
//! sockets and the event loop; it feeds bytes into each connection's two
//! ring buffers and drives the per-transaction analysers until they reach
//! a terminal state or report that they need more data. A transaction is
//! only ever touched by one activation at a time, so the core carries no
//! locks.
//!
//! A minimal driving loop looks like this:
//!
//! ```
//! use relais::buffer::Buffer;
//! use relais::config::{BackendConfig, FrontendConfig};
//! use relais::protocol::http::{AnalyserStatus, Transaction};
//!
//! let fe = FrontendConfig::default();
//! let be = BackendConfig::default();
//! let mut req_buf = Buffer::with_capacity(16384);
//! let mut txn = Transaction::new();
//!
//! req_buf.write(b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n");
//! match txn.process_request_headers(&mut req_buf, &fe, &be, 0) {
//!     AnalyserStatus::Complete => { /* run rules, connect a backend ... */ }
//!     AnalyserStatus::NeedData => { /* poll for more client bytes */ }
//!     AnalyserStatus::Error(_) => { /* emit the canned answer and close */ }
//! }
//! ```

pub mod buffer;
pub mod compression;
pub mod config;
pub mod pool;
pub mod protocol;
pub mod rules;
pub mod stats;
