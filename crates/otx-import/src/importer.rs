use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use otx_audit::AuditUnitId;
use otx_checkpoint::Checkpoint;
use otx_feed::PulseSource;
use otx_runtime::ImportDelegate;
use serde_json::Value;
use tracing::info;

use crate::author::AuthorIdentity;
use crate::bundle::{pulse_to_bundle, BundleOptions};
use crate::sink::BundleSink;

/// Checkpoint key holding the `modified` time of the newest imported pulse.
pub const LATEST_PULSE_TIMESTAMP: &str = "latest_pulse_timestamp";

/// Look-back window when neither the checkpoint nor the config names a start.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;

pub struct PulseImporter {
    source: Arc<dyn PulseSource>,
    sink: Arc<dyn BundleSink>,
    author: Arc<AuthorIdentity>,
    options: BundleOptions,
    start_timestamp: Option<DateTime<Utc>>,
}

impl PulseImporter {
    pub fn new(
        source: Arc<dyn PulseSource>,
        sink: Arc<dyn BundleSink>,
        author: Arc<AuthorIdentity>,
        options: BundleOptions,
    ) -> Self {
        Self {
            source,
            sink,
            author,
            options,
            start_timestamp: None,
        }
    }

    /// Start point used until the checkpoint carries a high-water-mark.
    pub fn with_start_timestamp(mut self, start: Option<DateTime<Utc>>) -> Self {
        self.start_timestamp = start;
        self
    }

    /// Checkpoint value, else the configured start, else `now - 30 days`.
    pub fn high_water_mark(&self, checkpoint: &Checkpoint, now: DateTime<Utc>) -> DateTime<Utc> {
        checkpoint
            .get(LATEST_PULSE_TIMESTAMP)
            .and_then(decode_timestamp)
            .or(self.start_timestamp)
            .unwrap_or_else(|| now - Duration::days(DEFAULT_LOOKBACK_DAYS))
    }
}

/// RFC 3339 / naive string, or epoch seconds as a number or string.
fn decode_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => otx_config::snapshot::parse_timestamp(s),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

#[async_trait::async_trait]
impl ImportDelegate for PulseImporter {
    async fn import(&self, checkpoint: &Checkpoint, unit: &AuditUnitId) -> Result<Checkpoint> {
        let now = Utc::now();
        let since = self.high_water_mark(checkpoint, now);
        info!(
            unit_id = %unit,
            source = self.source.source_name(),
            since = %since.to_rfc3339_opts(SecondsFormat::Secs, true),
            "importing pulses"
        );

        let mut pulses = self
            .source
            .fetch_pulses_modified_since(since)
            .await
            .context("fetch pulses")?;
        pulses.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.id.cmp(&b.id)));

        let fetched = pulses.len();
        let mut latest: Option<DateTime<Utc>> = None;
        let mut imported = 0usize;
        for pulse in pulses.iter().filter(|p| p.modified > since) {
            let bundle = pulse_to_bundle(pulse, &self.author, &self.options, now);
            self.sink
                .submit(&bundle)
                .await
                .with_context(|| format!("submit bundle for pulse {}", pulse.id))?;
            info!(
                pulse_id = %pulse.id,
                indicators = bundle.stats.indicators,
                observables = bundle.stats.observables,
                skipped = bundle.stats.skipped_indicators,
                "pulse imported"
            );
            latest = Some(pulse.modified);
            imported += 1;
        }

        info!(
            fetched,
            imported,
            skipped = fetched - imported,
            "pulse import finished"
        );

        let mut partial = Checkpoint::new();
        if let Some(ts) = latest {
            partial.insert(
                LATEST_PULSE_TIMESTAMP,
                ts.to_rfc3339_opts(SecondsFormat::Micros, true),
            );
        }
        Ok(partial)
    }
}
