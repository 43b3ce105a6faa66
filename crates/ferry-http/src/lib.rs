//! HTTPS client used by the object-store drivers.
//!
//! Requests are buffered: drivers build an [`HttpRequest`], sign it, and hand
//! it to an [`HttpSend`]. The production sender is [`HttpClient`], one
//! keep-alive client per endpoint over the TLS transport; [`Retrying`] adds
//! the transport retry policy on top.

pub mod client;
pub mod error;
pub mod request;

pub use client::{HttpClient, HttpSend, Retrying};
pub use error::{HttpError, HttpResult};
pub use request::{encode_component, encode_path, HttpRequest, HttpResponse, Method};
