//! HTTP/1.1 protocol support: types, request parsing, response rendering,
//! and the cached date header.

pub mod date;
pub mod exchange;
pub mod parser;
pub mod response;
pub mod types;
