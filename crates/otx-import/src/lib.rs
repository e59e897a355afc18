//! otx-import
//!
//! The [`ImportDelegate`](otx_runtime::ImportDelegate) for AlienVault OTX:
//! fetch pulses past the high-water-mark, convert each to a STIX 2.1 bundle,
//! hand it to a [`BundleSink`], and report the new high-water-mark.

pub mod author;
pub mod bundle;
pub mod importer;
pub mod sink;

pub use author::AuthorIdentity;
pub use bundle::{pulse_to_bundle, BundleOptions, BundleStats, PulseBundle};
pub use importer::{PulseImporter, DEFAULT_LOOKBACK_DAYS, LATEST_PULSE_TIMESTAMP};
pub use sink::{BundleSink, DirectoryBundleSink, MemoryBundleSink};
