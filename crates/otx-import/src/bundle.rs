//! Pulse -> STIX 2.1 bundle.
//!
//! Ids are UUIDv5 over a stable key per object, so converting the same pulse
//! twice yields the same bundle and a replayed tick overwrites rather than
//! duplicates downstream.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SecondsFormat, Utc};
use otx_config::{AlienVaultSettings, TlpMarking};
use otx_feed::{NamedRef, Pulse, PulseIndicator};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::author::AuthorIdentity;

/// STIX 2.1 namespace for deterministic identifiers.
const STIX_NAMESPACE: Uuid = Uuid::from_u128(0x00ab_edb4_aa42_466c_9c01_fed2_3315_a9b7);

const OTX_PULSE_URL: &str = "https://otx.alienvault.com/pulse";

pub fn stix_id(kind: &str, key: &str) -> String {
    let name = format!("{kind}|{key}");
    format!("{kind}--{}", Uuid::new_v5(&STIX_NAMESPACE, name.as_bytes()))
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleOptions {
    pub default_tlp: TlpMarking,
    pub create_observables: bool,
    pub create_indicators: bool,
    pub filter_indicators: bool,
    pub enable_relationships: bool,
    pub enable_attack_patterns_indicates: bool,
    pub guess_malware: bool,
    pub guess_cve: bool,
    pub report_status: u8,
    pub report_type: String,
    /// Compared case-insensitively against the OTX indicator type.
    pub excluded_indicator_types: BTreeSet<String>,
}

impl From<&AlienVaultSettings> for BundleOptions {
    fn from(s: &AlienVaultSettings) -> Self {
        Self {
            default_tlp: s.tlp,
            create_observables: s.create_observables,
            create_indicators: s.create_indicators,
            filter_indicators: s.filter_indicators,
            enable_relationships: s.enable_relationships,
            enable_attack_patterns_indicates: s.enable_attack_patterns_indicates,
            guess_malware: s.guess_malware,
            guess_cve: s.guess_cve,
            report_status: s.report_status.code(),
            report_type: s.report_type.clone(),
            excluded_indicator_types: s
                .excluded_pulse_indicator_types
                .iter()
                .map(|t| t.to_lowercase())
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// TLP marking definitions
// ---------------------------------------------------------------------------

pub fn marking_id(tlp: TlpMarking) -> &'static str {
    match tlp {
        TlpMarking::White => "marking-definition--613f2e26-407d-48c7-9eca-b8e91df99dc9",
        TlpMarking::Green => "marking-definition--34098fce-860f-48ae-8e50-ebd3cc5e41da",
        TlpMarking::Amber => "marking-definition--f88d31f6-486f-44da-b317-01333bde0b82",
        TlpMarking::AmberStrict => "marking-definition--826578e1-40ad-459f-bc73-ede076f81f37",
        TlpMarking::Red => "marking-definition--5e57c739-391a-4eb3-b6be-7d15ca92d5ed",
    }
}

fn marking_definition(tlp: TlpMarking) -> Value {
    let level = tlp
        .as_str()
        .trim_start_matches("TLP:")
        .to_lowercase();
    json!({
        "type": "marking-definition",
        "spec_version": "2.1",
        "id": marking_id(tlp),
        "created": "2017-01-20T00:00:00.000Z",
        "definition_type": "tlp",
        "name": tlp.as_str(),
        "definition": { "tlp": level },
    })
}

// ---------------------------------------------------------------------------
// Indicator type mapping
// ---------------------------------------------------------------------------

struct Detection {
    pattern: String,
    pattern_type: &'static str,
    observable: Option<Value>,
}

fn escape_pattern(v: &str) -> String {
    v.replace('\\', "\\\\").replace('\'', "\\'")
}

fn sco(kind: &str, body: Value) -> Value {
    let key = body.to_string();
    let mut obj = json!({
        "type": kind,
        "spec_version": "2.1",
        "id": stix_id(kind, &key),
    });
    if let (Value::Object(dst), Value::Object(src)) = (&mut obj, body) {
        dst.extend(src);
    }
    obj
}

fn value_detection(kind: &str, value: &str) -> Detection {
    Detection {
        pattern: format!("[{kind}:value = '{}']", escape_pattern(value)),
        pattern_type: "stix",
        observable: Some(sco(kind, json!({ "value": value }))),
    }
}

fn hash_detection(algo: &str, value: &str) -> Detection {
    Detection {
        pattern: format!("[file:hashes.'{algo}' = '{}']", escape_pattern(value)),
        pattern_type: "stix",
        observable: Some(sco("file", json!({ "hashes": { algo: value } }))),
    }
}

/// `None` for types with no detection mapping (CVE is handled separately).
fn detect(indicator_type: &str, value: &str) -> Option<Detection> {
    let d = match indicator_type.to_ascii_lowercase().as_str() {
        "ipv4" => value_detection("ipv4-addr", value),
        "ipv6" => value_detection("ipv6-addr", value),
        "cidr" if value.contains(':') => value_detection("ipv6-addr", value),
        "cidr" => value_detection("ipv4-addr", value),
        "domain" | "hostname" => value_detection("domain-name", value),
        "url" | "uri" => value_detection("url", value),
        "email" => value_detection("email-addr", value),
        "mutex" => Detection {
            pattern: format!("[mutex:name = '{}']", escape_pattern(value)),
            pattern_type: "stix",
            observable: Some(sco("mutex", json!({ "name": value }))),
        },
        "filepath" => Detection {
            pattern: format!("[file:name = '{}']", escape_pattern(value)),
            pattern_type: "stix",
            observable: Some(sco("file", json!({ "name": value }))),
        },
        "filehash-md5" => hash_detection("MD5", value),
        "filehash-sha1" => hash_detection("SHA-1", value),
        "filehash-sha256" => hash_detection("SHA-256", value),
        "yara" => Detection {
            pattern: value.to_string(),
            pattern_type: "yara",
            observable: None,
        },
        _ => return None,
    };
    Some(d)
}

fn is_cve(indicator_type: &str) -> bool {
    indicator_type.eq_ignore_ascii_case("cve")
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleStats {
    pub indicators: usize,
    pub observables: usize,
    pub relationships: usize,
    pub malware: usize,
    pub vulnerabilities: usize,
    pub attack_patterns: usize,
    pub skipped_indicators: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PulseBundle {
    pub pulse_id: String,
    pub modified: DateTime<Utc>,
    pub bundle: Value,
    pub stats: BundleStats,
}

/// Collects objects in insertion order, deduplicated by id.
#[derive(Default)]
struct Objects {
    order: Vec<String>,
    by_id: BTreeMap<String, Value>,
}

impl Objects {
    fn push(&mut self, obj: Value) -> String {
        let id = obj["id"].as_str().unwrap_or_default().to_string();
        if !self.by_id.contains_key(&id) {
            self.order.push(id.clone());
            self.by_id.insert(id.clone(), obj);
        }
        id
    }

    fn ids(&self) -> Vec<String> {
        self.order.clone()
    }

    fn into_values(mut self) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.remove(id))
            .collect()
    }
}

struct Ctx<'a> {
    author: &'a AuthorIdentity,
    marking: &'static str,
    created: String,
    modified: String,
}

impl Ctx<'_> {
    fn sdo(&self, kind: &str, id: String, body: Value) -> Value {
        let mut obj = json!({
            "type": kind,
            "spec_version": "2.1",
            "id": id,
            "created_by_ref": self.author.id(),
            "created": self.created,
            "modified": self.modified,
            "object_marking_refs": [self.marking],
        });
        if let (Value::Object(dst), Value::Object(src)) = (&mut obj, body) {
            dst.extend(src);
        }
        obj
    }

    fn relationship(&self, rel: &str, source: &str, target: &str) -> Value {
        self.sdo(
            "relationship",
            stix_id("relationship", &format!("{rel}|{source}|{target}")),
            json!({
                "relationship_type": rel,
                "source_ref": source,
                "target_ref": target,
            }),
        )
    }
}

fn external_ref(source_name: &str, external_id: &str) -> Value {
    json!([{ "source_name": source_name, "external_id": external_id }])
}

pub fn pulse_to_bundle(
    pulse: &Pulse,
    author: &AuthorIdentity,
    opts: &BundleOptions,
    now: DateTime<Utc>,
) -> PulseBundle {
    let tlp = pulse
        .tlp
        .as_deref()
        .and_then(TlpMarking::parse)
        .unwrap_or(opts.default_tlp);
    let ctx = Ctx {
        author,
        marking: marking_id(tlp),
        created: ts(pulse.created),
        modified: ts(pulse.modified),
    };

    let mut stats = BundleStats::default();
    let mut content = Objects::default();

    let malware_ids: Vec<String> = if opts.guess_malware {
        pulse
            .malware_families
            .iter()
            .filter_map(NamedRef::display)
            .map(|name| {
                let id = stix_id("malware", &name.to_lowercase());
                content.push(ctx.sdo(
                    "malware",
                    id,
                    json!({ "name": name, "is_family": true }),
                ))
            })
            .collect()
    } else {
        Vec::new()
    };
    stats.malware = malware_ids.len();

    let attack_pattern_ids: Vec<String> = pulse
        .attack_ids
        .iter()
        .filter_map(|r| {
            let ext = r.id()?.trim();
            if ext.is_empty() {
                return None;
            }
            let name = r.display().unwrap_or(ext);
            Some(content.push(ctx.sdo(
                "attack-pattern",
                stix_id("attack-pattern", &ext.to_uppercase()),
                json!({
                    "name": name,
                    "external_references": external_ref("mitre-attack", ext),
                }),
            )))
        })
        .collect();
    stats.attack_patterns = attack_pattern_ids.len();

    for ind in &pulse.indicators {
        if opts
            .excluded_indicator_types
            .contains(&ind.kind.to_lowercase())
        {
            stats.skipped_indicators += 1;
            continue;
        }
        if opts.filter_indicators && ind.is_expired_at(now) {
            stats.skipped_indicators += 1;
            continue;
        }
        if is_cve(&ind.kind) {
            if opts.guess_cve {
                let name = ind.indicator.trim().to_uppercase();
                content.push(ctx.sdo(
                    "vulnerability",
                    stix_id("vulnerability", &name),
                    json!({
                        "name": name,
                        "external_references": external_ref("cve", &name),
                    }),
                ));
                stats.vulnerabilities += 1;
            } else {
                stats.skipped_indicators += 1;
            }
            continue;
        }
        let Some(detection) = detect(&ind.kind, &ind.indicator) else {
            tracing::debug!(pulse_id = %pulse.id, kind = %ind.kind, "unsupported indicator type");
            stats.skipped_indicators += 1;
            continue;
        };

        add_indicator(
            &ctx,
            opts,
            ind,
            detection,
            &malware_ids,
            &attack_pattern_ids,
            &mut content,
            &mut stats,
        );
    }

    let mut object_refs = content.ids();
    if object_refs.is_empty() {
        object_refs.push(author.id().to_string());
    }

    let mut references = vec![json!({
        "source_name": "AlienVault OTX",
        "external_id": pulse.id,
        "url": format!("{OTX_PULSE_URL}/{}", pulse.id),
    })];
    references.extend(
        pulse
            .references
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .map(|u| json!({ "source_name": pulse.author_name.as_str(), "url": u })),
    );

    let report = ctx.sdo(
        "report",
        stix_id("report", &pulse.id),
        json!({
            "name": pulse.name,
            "description": pulse.description,
            "published": ctx.created,
            "report_types": [opts.report_type],
            "labels": pulse.tags,
            "object_refs": object_refs,
            "external_references": references,
            "x_opencti_report_status": opts.report_status,
        }),
    );

    let mut objects = vec![author.to_stix(), marking_definition(tlp)];
    objects.extend(content.into_values());
    objects.push(report);

    let bundle = json!({
        "type": "bundle",
        "id": stix_id("bundle", &format!("{}|{}", pulse.id, pulse.modified.timestamp())),
        "objects": objects,
    });

    PulseBundle {
        pulse_id: pulse.id.clone(),
        modified: pulse.modified,
        bundle,
        stats,
    }
}

#[allow(clippy::too_many_arguments)]
fn add_indicator(
    ctx: &Ctx<'_>,
    opts: &BundleOptions,
    ind: &PulseIndicator,
    detection: Detection,
    malware_ids: &[String],
    attack_pattern_ids: &[String],
    content: &mut Objects,
    stats: &mut BundleStats,
) {
    let observable_id = if opts.create_observables {
        detection.observable.map(|o| {
            stats.observables += 1;
            content.push(o)
        })
    } else {
        None
    };

    if !opts.create_indicators {
        return;
    }

    let mut body = json!({
        "name": ind.indicator,
        "description": ind.description,
        "pattern": detection.pattern,
        "pattern_type": detection.pattern_type,
        "valid_from": ts(ind.created),
    });
    if let Some(until) = ind.expiration.filter(|e| *e > ind.created) {
        body["valid_until"] = Value::String(ts(until));
    }
    let indicator_id = content.push(ctx.sdo(
        "indicator",
        stix_id("indicator", &detection.pattern),
        body,
    ));
    stats.indicators += 1;

    if !opts.enable_relationships {
        return;
    }
    let mut rels: Vec<Value> = Vec::new();
    if let Some(obs) = observable_id.as_deref() {
        rels.push(ctx.relationship("based-on", &indicator_id, obs));
    }
    rels.extend(
        malware_ids
            .iter()
            .map(|m| ctx.relationship("indicates", &indicator_id, m)),
    );
    if opts.enable_attack_patterns_indicates {
        rels.extend(
            attack_pattern_ids
                .iter()
                .map(|a| ctx.relationship("indicates", &indicator_id, a)),
        );
    }
    for rel in rels {
        content.push(rel);
        stats.relationships += 1;
    }
}
