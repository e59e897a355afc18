//! otx-feed
//!
//! Pulse model and the pulse-source boundary for the AlienVault OTX feed.
//!
//! This crate fetches and decodes pulses. It does not convert them and it
//! does not track progress; the importer owns the high-water-mark.

pub mod client;
pub mod model;

pub use client::OtxClient;
pub use model::{NamedRef, Pulse, PulseIndicator};

use anyhow::Result;
use chrono::{DateTime, Utc};

/// Pluggable pulse source.
#[async_trait::async_trait]
pub trait PulseSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// Every subscribed pulse modified after `since`, in the order the
    /// upstream returned them. Callers sort.
    async fn fetch_pulses_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Pulse>>;
}
