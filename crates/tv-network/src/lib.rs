//! TV Network Layer
//!
//! Minimal async HTTP client used for two things:
//! 1. Downloading the encrypted tunnel configuration blob
//! 2. Talking to the content API once the backend is reachable

mod client;

pub use client::{HttpClient, HttpClientConfig, HttpError, Response};
