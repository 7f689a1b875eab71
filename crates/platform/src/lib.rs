//! Outbound client for the messaging automation platform.
//!
//! The platform is the system of record for subscriber profiles, tags and
//! custom fields; this crate wraps its REST API behind [`PlatformClient`] so
//! the sync layer can be tested against [`FakePlatformClient`].

pub mod client;
pub mod fake;
pub mod http;

pub use client::{PlatformClient, PlatformError, SubscriberUpdate};
pub use fake::FakePlatformClient;
pub use http::HttpPlatformClient;
