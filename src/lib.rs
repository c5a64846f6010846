//! Weft: a shared-nothing HTTP/1.1 server built on per-worker cooperative
//! reactors.
//!
//! # Architecture
//!
//! The server runs N independent workers. Each worker is a single OS thread
//! that owns an event selector, a fixed list of cooperative services wired
//! together by bounded SPSC queues, and a disjoint set of connections it
//! alone may touch. There is no locking inside a worker; the only
//! cross-thread traffic is the acceptor-to-worker handoff of freshly
//! accepted sockets and handler-registration broadcasts.
//!
//! ```text
//! ┌─────────────────────────── Worker thread ───────────────────────────┐
//! │  Selector ──▶ events ──▶ ┌────────┐  ┌──────┐  ┌────────┐  ┌──────┐ │
//! │                          │ accept │─▶│ read │─▶│ handle │─▶│ write│ │
//! │  inbox  ──▶ messages ──▶ └────────┘  └──────┘  └────────┘  └──────┘ │
//! │              (SPSC queues between services; one runs at a time)     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Connections are distributed either by a dedicated acceptor thread that
//! rotates over the workers, or by giving every worker its own
//! `SO_REUSEPORT` listen socket and letting the kernel spread the load.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft::{HttpResponse, Server, ServerConfig};
//!
//! let config = ServerConfig::default().address("127.0.0.1:8080".parse().unwrap());
//! let server = Server::bind(config).unwrap();
//! server.register_url_handler("/hello", Arc::new(|ex: weft::HttpExchange| {
//!     ex.connection().append_response(HttpResponse::ok_with_content_type(
//!         b"hi".as_slice(),
//!         "text/plain",
//!     ));
//! }));
//! server.join();
//! ```

// Denied rather than forbidden: the selector module alone carries a
// narrowly scoped allow for the poller registration calls, whose
// descriptor-validity contract the compiler cannot check.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod handler;
pub mod http;
pub mod queue;
pub mod reactor;
pub mod server;
pub mod stats;
pub(crate) mod worker;

pub use config::ServerConfig;
pub use conn::Connection;
pub use error::{CloseReason, Error, ErrorKind, Result};
pub use handler::Handler;
pub use http::exchange::HttpExchange;
pub use http::response::{HeaderValue, HttpResponse};
pub use http::types::{Method, Version};
pub use server::Server;
pub use stats::ServerStats;
