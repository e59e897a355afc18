//! Resolved, immutable configuration.
//!
//! [`ConfigSnapshot::resolve`] is called once at startup. Any error it returns
//! is fatal: the process must not enter the scheduling loop.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::duration::IsoDuration;
use crate::error::ConfigError;
use crate::resolver::ConfigResolver;
use crate::schema::{self, TLP_TOKENS};

pub const DEFAULT_INTERVAL_SEC: u64 = 1800;

// ---------------------------------------------------------------------------
// Enumerated settings
// ---------------------------------------------------------------------------

/// Traffic Light Protocol classification marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TlpMarking {
    #[default]
    White,
    Green,
    Amber,
    AmberStrict,
    Red,
}

impl TlpMarking {
    /// Case-insensitive; accepts an optional `tlp:` prefix. `clear` is TLP 2.0's
    /// name for `white`.
    pub fn parse(s: &str) -> Option<Self> {
        let t = s.trim().to_lowercase();
        let t = t.strip_prefix("tlp:").unwrap_or(&t);
        match t {
            "white" | "clear" => Some(TlpMarking::White),
            "green" => Some(TlpMarking::Green),
            "amber" => Some(TlpMarking::Amber),
            "amber+strict" => Some(TlpMarking::AmberStrict),
            "red" => Some(TlpMarking::Red),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlpMarking::White => "TLP:WHITE",
            TlpMarking::Green => "TLP:GREEN",
            TlpMarking::Amber => "TLP:AMBER",
            TlpMarking::AmberStrict => "TLP:AMBER+STRICT",
            TlpMarking::Red => "TLP:RED",
        }
    }
}

/// Workflow status given to created reports, with its platform ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportStatus {
    New,
    InProgress,
    Analyzed,
    Closed,
}

impl ReportStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "new" => Some(ReportStatus::New),
            "in progress" => Some(ReportStatus::InProgress),
            "analyzed" => Some(ReportStatus::Analyzed),
            "closed" => Some(ReportStatus::Closed),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ReportStatus::New => 0,
            ReportStatus::InProgress => 1,
            ReportStatus::Analyzed => 2,
            ReportStatus::Closed => 3,
        }
    }
}

/// Tick cadence. The enum makes "exactly one mode" unrepresentable otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Calendar-aware ISO-8601 period (`connector.duration_period`).
    Period(IsoDuration),
    /// Plain interval (`alienvault.interval_sec`).
    Interval(Duration),
}

impl Cadence {
    /// When the tick after one started at `start` is due.
    pub fn next_after(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Cadence::Period(d) => d.add_to(start),
            Cadence::Interval(iv) => chrono::Duration::from_std(*iv)
                .ok()
                .and_then(|d| start.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Period(d) => write!(f, "duration {d}"),
            Cadence::Interval(iv) => write!(f, "interval {}s", iv.as_secs()),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorSettings {
    pub id: String,
    pub name: String,
    pub log_level: String,
    pub run_and_terminate: bool,
    pub cycle_timeout: Option<Duration>,
    pub state_path: PathBuf,
    pub work_log_path: PathBuf,
    pub bundle_dir: PathBuf,
    pub status_addr: Option<SocketAddr>,
}

/// Feed and conversion settings. **`api_key` is redacted in `Debug` output.**
#[derive(Clone, PartialEq)]
pub struct AlienVaultSettings {
    pub base_url: String,
    pub api_key: String,
    pub tlp: TlpMarking,
    pub create_observables: bool,
    pub create_indicators: bool,
    pub filter_indicators: bool,
    pub enable_relationships: bool,
    pub enable_attack_patterns_indicates: bool,
    pub guess_malware: bool,
    pub guess_cve: bool,
    pub report_status: ReportStatus,
    pub report_type: String,
    pub excluded_pulse_indicator_types: BTreeSet<String>,
    pub pulse_start_timestamp: Option<DateTime<Utc>>,
}

impl fmt::Debug for AlienVaultSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlienVaultSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &"<REDACTED>")
            .field("tlp", &self.tlp)
            .field("create_observables", &self.create_observables)
            .field("create_indicators", &self.create_indicators)
            .field("filter_indicators", &self.filter_indicators)
            .field("enable_relationships", &self.enable_relationships)
            .field(
                "enable_attack_patterns_indicates",
                &self.enable_attack_patterns_indicates,
            )
            .field("guess_malware", &self.guess_malware)
            .field("guess_cve", &self.guess_cve)
            .field("report_status", &self.report_status)
            .field("report_type", &self.report_type)
            .field(
                "excluded_pulse_indicator_types",
                &self.excluded_pulse_indicator_types,
            )
            .field("pulse_start_timestamp", &self.pulse_start_timestamp)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub connector: ConnectorSettings,
    pub alienvault: AlienVaultSettings,
    pub cadence: Cadence,
}

impl ConfigSnapshot {
    pub fn resolve(r: &ConfigResolver<'_>) -> Result<Self, ConfigError> {
        // Credentials first: nothing else matters without them.
        let base_url = r.required_text(&schema::BASE_URL)?;
        let api_key = r.required_text(&schema::API_KEY)?;

        let tlp = resolve_tlp(r)?;

        let report_status = match r.token(&schema::REPORT_STATUS)? {
            Some(token) => ReportStatus::parse(&token).ok_or_else(|| ConfigError::InvalidEnum {
                key: schema::REPORT_STATUS.key,
                value: token,
                expected: schema::REPORT_STATUS_TOKENS.join(" | "),
            })?,
            None => {
                return Err(ConfigError::Missing {
                    key: schema::REPORT_STATUS.key,
                    env_var: schema::REPORT_STATUS.env_var(),
                })
            }
        };

        let alienvault = AlienVaultSettings {
            base_url,
            api_key,
            tlp,
            create_observables: r.boolean(&schema::CREATE_OBSERVABLES)?,
            create_indicators: r.boolean(&schema::CREATE_INDICATORS)?,
            filter_indicators: r.boolean(&schema::FILTER_INDICATORS)?,
            enable_relationships: r.boolean(&schema::ENABLE_RELATIONSHIPS)?,
            enable_attack_patterns_indicates: r
                .boolean(&schema::ENABLE_ATTACK_PATTERNS_INDICATES)?,
            guess_malware: r.boolean(&schema::GUESS_MALWARE)?,
            guess_cve: r.boolean(&schema::GUESS_CVE)?,
            report_status,
            report_type: r.required_text(&schema::REPORT_TYPE)?,
            excluded_pulse_indicator_types: r.list(&schema::EXCLUDED_PULSE_INDICATOR_TYPES)?,
            pulse_start_timestamp: resolve_start_timestamp(r)?,
        };

        let connector = ConnectorSettings {
            id: r.required_text(&schema::CONNECTOR_ID)?,
            name: r.required_text(&schema::CONNECTOR_NAME)?,
            log_level: r.required_text(&schema::LOG_LEVEL)?,
            run_and_terminate: r.boolean(&schema::RUN_AND_TERMINATE)?,
            cycle_timeout: r
                .number(&schema::CYCLE_TIMEOUT_SEC)?
                .filter(|secs| *secs > 0)
                .map(|secs| Duration::from_secs(secs as u64)),
            state_path: PathBuf::from(r.required_text(&schema::STATE_PATH)?),
            work_log_path: PathBuf::from(r.required_text(&schema::WORK_LOG_PATH)?),
            bundle_dir: PathBuf::from(r.required_text(&schema::BUNDLE_DIR)?),
            status_addr: resolve_status_addr(r)?,
        };

        Ok(Self {
            connector,
            alienvault,
            cadence: resolve_cadence(r)?,
        })
    }
}

fn resolve_tlp(r: &ConfigResolver<'_>) -> Result<TlpMarking, ConfigError> {
    // Absence maps straight to the fixed default marking.
    let Some(raw) = r.lookup(&schema::TLP) else {
        return Ok(TlpMarking::default());
    };
    let value = match raw {
        crate::RawValue::Env(s) => s,
        crate::RawValue::File(v) => v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()),
    };
    TlpMarking::parse(&value).ok_or_else(|| ConfigError::InvalidEnum {
        key: schema::TLP.key,
        value,
        expected: TLP_TOKENS.join(" | "),
    })
}

/// Duration period wins when both are configured; otherwise interval mode
/// with a non-positive or absent interval meaning the default.
fn resolve_cadence(r: &ConfigResolver<'_>) -> Result<Cadence, ConfigError> {
    if let Some(period) = r.text(&schema::DURATION_PERIOD)? {
        let parsed = IsoDuration::parse(&period).map_err(|reason| ConfigError::InvalidDuration {
            key: schema::DURATION_PERIOD.key,
            value: period.clone(),
            reason,
        })?;
        return Ok(Cadence::Period(parsed));
    }
    let secs = match r.number(&schema::INTERVAL_SEC)? {
        Some(n) if n > 0 => n as u64,
        _ => DEFAULT_INTERVAL_SEC,
    };
    Ok(Cadence::Interval(Duration::from_secs(secs)))
}

fn resolve_start_timestamp(r: &ConfigResolver<'_>) -> Result<Option<DateTime<Utc>>, ConfigError> {
    let Some(value) = r.text(&schema::PULSE_START_TIMESTAMP)? else {
        return Ok(None);
    };
    parse_timestamp(&value)
        .map(Some)
        .ok_or_else(|| ConfigError::InvalidTimestamp {
            key: schema::PULSE_START_TIMESTAMP.key,
            value,
        })
}

/// RFC 3339, naive `YYYY-MM-DDTHH:MM:SS[.f]` (taken as UTC), or epoch seconds.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    s.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn resolve_status_addr(r: &ConfigResolver<'_>) -> Result<Option<SocketAddr>, ConfigError> {
    let Some(value) = r.text(&schema::STATUS_ADDR)? else {
        return Ok(None);
    };
    value
        .parse::<SocketAddr>()
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: schema::STATUS_ADDR.key,
            reason: format!("{value:?} is not a socket address: {e}"),
        })
}
