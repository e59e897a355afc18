//! Pulse payload as served by `/api/v1/pulses/subscribed`.
//!
//! OTX is loose with its JSON: strings come back as `null`, timestamps
//! usually carry no offset, and malware families / ATT&CK ids are either
//! bare strings or small objects. Decoding here absorbs that so the importer
//! sees one shape.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pulse {
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub author_name: String,
    #[serde(with = "otx_time")]
    pub created: DateTime<Utc>,
    #[serde(with = "otx_time")]
    pub modified: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub references: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub malware_families: Vec<NamedRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attack_ids: Vec<NamedRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub indicators: Vec<PulseIndicator>,
    #[serde(default)]
    pub tlp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseIndicator {
    #[serde(default)]
    pub id: Option<i64>,
    pub indicator: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "otx_time")]
    pub created: DateTime<Utc>,
    #[serde(default, with = "otx_time_opt")]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
}

impl PulseIndicator {
    /// Expired strictly before `now`. Indicators without an expiration never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map(|exp| exp < now).unwrap_or(false)
    }
}

/// Malware family or ATT&CK reference: `"T1059"` or
/// `{"id": "T1059", "display_name": "T1059 - Command and Scripting Interpreter"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NamedRef {
    Plain(String),
    Object {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
}

impl NamedRef {
    pub fn id(&self) -> Option<&str> {
        match self {
            NamedRef::Plain(s) => Some(s.as_str()),
            NamedRef::Object { id, .. } => id.as_deref(),
        }
    }

    /// Best human-readable name: display name, then name, then id.
    pub fn display(&self) -> Option<&str> {
        match self {
            NamedRef::Plain(s) => Some(s.as_str()),
            NamedRef::Object {
                id,
                display_name,
                name,
            } => display_name
                .as_deref()
                .or(name.as_deref())
                .or(id.as_deref()),
        }
        .map(str::trim)
        .filter(|s| !s.is_empty())
    }
}

fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

/// Parse an OTX timestamp. Offset-less values are UTC.
pub fn parse_otx_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|n| n.and_utc())
}

mod otx_time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_otx_timestamp(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid OTX timestamp '{raw}'")))
    }
}

mod otx_time_opt {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Micros, true)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => super::parse_otx_timestamp(&raw)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("invalid OTX timestamp '{raw}'"))),
        }
    }
}
