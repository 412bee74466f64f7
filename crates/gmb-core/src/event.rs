//! Worker event model.
//!
//! The worker prints one JSON object per line on stdout. Every object carries
//! a `type` discriminant and (usually) a `timestamp`; the remaining fields
//! depend on the type. [`parse_event_line`] turns one such line into an
//! [`Event`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A single business listing as produced by the worker.
///
/// Every field is optional on the wire; missing strings deserialize as empty
/// and missing numbers as `None` / `0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessRecord {
    pub name: String,
    pub place_id: String,
    pub address: String,
    pub phone: String,
    /// Digits-only form of `phone`.
    pub phone_clean: String,
    pub email: String,
    pub website: String,
    pub category: String,
    pub rating: Option<f64>,
    pub review_count: u64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub google_maps_url: String,
    /// Fields this model does not name, kept so they survive re-serialization.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BusinessRecord {
    /// Key used to match a `business_updated` record with an earlier one.
    pub fn identity(&self) -> &str {
        if self.place_id.is_empty() {
            &self.name
        } else {
            &self.place_id
        }
    }
}

/// Final (or running) counters for a scrape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stats {
    pub total: u64,
    pub with_phone: u64,
    pub with_email: u64,
    pub with_website: u64,
    pub with_address: u64,
    pub with_category: u64,
    pub with_rating: u64,
    pub filtered_out: u64,
    pub duration_seconds: f64,
}

impl Stats {
    /// Compute stats from a business list.
    pub fn tally(businesses: &[BusinessRecord], filtered_out: u64, duration_seconds: f64) -> Self {
        let count = |f: fn(&BusinessRecord) -> bool| businesses.iter().filter(|b| f(b)).count() as u64;
        Self {
            total: businesses.len() as u64,
            with_phone: count(|b| !b.phone.is_empty()),
            with_email: count(|b| !b.email.is_empty()),
            with_website: count(|b| !b.website.is_empty()),
            with_address: count(|b| !b.address.is_empty()),
            with_category: count(|b| !b.category.is_empty()),
            with_rating: count(|b| b.rating.is_some_and(|r| r > 0.0)),
            filtered_out,
            duration_seconds: (duration_seconds * 10.0).round() / 10.0,
        }
    }

    /// `true` when no `with_*` counter exceeds `total`.
    pub fn is_consistent(&self) -> bool {
        [
            self.with_phone,
            self.with_email,
            self.with_website,
            self.with_address,
            self.with_category,
            self.with_rating,
        ]
        .iter()
        .all(|&n| n <= self.total)
    }
}

/// The typed payload of an [`Event`], discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Synthesized by the streaming adapter before anything else.
    Job { job_id: Uuid },
    Start {
        activity: String,
        city: String,
        grid_size: u32,
        total_zones: u32,
    },
    Status { message: String },
    Warning { message: String },
    Progress {
        zone: u32,
        total_zones: u32,
        #[serde(default)]
        percent: f64,
        #[serde(default)]
        new_businesses: u64,
        #[serde(default)]
        total_businesses: u64,
    },
    Business { data: BusinessRecord },
    BusinessUpdated { data: BusinessRecord },
    StatsUpdate(Stats),
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stats: Option<Stats>,
        #[serde(default)]
        businesses: Vec<BusinessRecord>,
    },
    Error { message: String },
    /// Heartbeat, synthesized by the streaming adapter.
    Ping,
}

impl EventKind {
    /// The wire name of this variant (the value of `type`).
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Job { .. } => "job",
            EventKind::Start { .. } => "start",
            EventKind::Status { .. } => "status",
            EventKind::Warning { .. } => "warning",
            EventKind::Progress { .. } => "progress",
            EventKind::Business { .. } => "business",
            EventKind::BusinessUpdated { .. } => "business_updated",
            EventKind::StatsUpdate(_) => "stats_update",
            EventKind::Complete { .. } => "complete",
            EventKind::Error { .. } => "error",
            EventKind::Ping => "ping",
        }
    }
}

/// One timestamped event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    /// Kept as the worker wrote it; synthesized events use RFC 3339 UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// The object exactly as the worker printed it. `None` for synthesized
    /// events.
    #[serde(skip)]
    pub raw: Option<Map<String, Value>>,
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn now(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
            raw: None,
        }
    }

    pub fn job(job_id: Uuid) -> Self {
        Self::now(EventKind::Job { job_id })
    }

    pub fn ping() -> Self {
        Self::now(EventKind::Ping)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::now(EventKind::Error {
            message: message.into(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// `complete` and `error` end a job; nothing is delivered after them.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Complete { .. } | EventKind::Error { .. })
    }

    /// Wire form of the event. Worker events come back verbatim, including
    /// fields the typed model ignores.
    pub fn to_json(&self) -> serde_json::Result<Value> {
        match &self.raw {
            Some(raw) => Ok(Value::Object(raw.clone())),
            None => serde_json::to_value(self),
        }
    }

    /// Write the typed value of `fields` back into the raw object after the
    /// typed payload was edited.
    pub(crate) fn sync_raw(&mut self, fields: &[&str]) {
        if self.raw.is_none() {
            return;
        }
        let typed = match serde_json::to_value(&self.kind) {
            Ok(Value::Object(typed)) => typed,
            _ => {
                self.raw = None;
                return;
            }
        };
        if let Some(raw) = self.raw.as_mut() {
            for field in fields {
                match typed.get(*field) {
                    Some(value) => raw.insert((*field).to_string(), value.clone()),
                    None => raw.remove(*field),
                };
            }
        }
    }
}

/// Event types the worker is allowed to emit. `job` and `ping` are reserved
/// for the adapter and ignored when they show up on stdout.
const WORKER_EVENT_TYPES: &[&str] = &[
    "start",
    "status",
    "warning",
    "progress",
    "business",
    "business_updated",
    "stats_update",
    "complete",
    "error",
];

/// A stdout line that could not be turned into an [`Event`].
#[derive(Debug, thiserror::Error)]
pub enum MalformedEventError {
    #[error("line is not a JSON object: {0}")]
    NotJson(#[source] serde_json::Error),

    #[error("line has no string `type` field")]
    MissingType,

    #[error("invalid `{event_type}` event: {source}")]
    InvalidShape {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse a single stdout line from the worker.
///
/// Returns `Ok(None)` for well-formed JSON whose `type` is not part of the
/// protocol; callers ignore those. `Err` means the line is malformed and
/// should be dropped.
pub fn parse_event_line(line: &str) -> Result<Option<Event>, MalformedEventError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(MalformedEventError::NotJson)?;

    let event_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(MalformedEventError::MissingType)?;

    if !WORKER_EVENT_TYPES.contains(&event_type) {
        return Ok(None);
    }
    let event_type = event_type.to_string();
    let raw = value.as_object().cloned();

    let mut event: Event = serde_json::from_value(value)
        .map_err(|source| MalformedEventError::InvalidShape { event_type, source })?;
    event.raw = raw;
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn business(name: &str) -> BusinessRecord {
        BusinessRecord {
            name: name.to_string(),
            place_id: format!("id-{name}"),
            ..Default::default()
        }
    }

    #[test]
    fn parses_business_line() {
        let line = r#"{"type":"business","timestamp":"2024-05-01T10:00:00","data":{"name":"Chez Marcel","place_id":"0x1","phone":"01 23 45 67 89","phone_clean":"0123456789","rating":4.5,"review_count":12,"latitude":48.85,"longitude":2.35}}"#;
        let event = parse_event_line(line).unwrap().unwrap();
        assert_eq!(event.timestamp.as_deref(), Some("2024-05-01T10:00:00"));
        let EventKind::Business { data } = event.kind else {
            panic!("expected business event");
        };
        assert_eq!(data.name, "Chez Marcel");
        assert_eq!(data.phone_clean, "0123456789");
        assert_eq!(data.rating, Some(4.5));
        assert_eq!(data.review_count, 12);
        assert!(data.email.is_empty());
    }

    #[test]
    fn parses_progress_with_extra_fields() {
        let line = r#"{"type":"progress","zone":3,"total_zones":48,"zoom":15,"new_businesses":2,"total_businesses":9,"percent":6.2,"api_emails_found":1}"#;
        let event = parse_event_line(line).unwrap().unwrap();
        assert_eq!(
            event.kind,
            EventKind::Progress {
                zone: 3,
                total_zones: 48,
                percent: 6.2,
                new_businesses: 2,
                total_businesses: 9,
            }
        );
        assert!(event.timestamp.is_none());

        let wire = event.to_json().unwrap();
        assert_eq!(wire["zoom"], 15);
        assert_eq!(wire["api_emails_found"], 1);
        assert_eq!(wire, serde_json::from_str::<Value>(line).unwrap());
    }

    #[test]
    fn business_record_keeps_unknown_fields() {
        let line = r#"{"type":"business","data":{"name":"Chez Marcel","opening_hours":"9-18"}}"#;
        let event = parse_event_line(line).unwrap().unwrap();
        let EventKind::Business { data } = event.kind else {
            panic!("expected business event");
        };
        assert_eq!(data.extra["opening_hours"], "9-18");
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["opening_hours"], "9-18");
        assert_eq!(json["name"], "Chez Marcel");
    }

    #[test]
    fn synthesized_events_serialize_from_typed_payload() {
        let wire = Event::error("boom").to_json().unwrap();
        assert_eq!(wire["type"], "error");
        assert_eq!(wire["message"], "boom");
    }

    #[test]
    fn parses_complete_without_businesses() {
        let line = r#"{"type":"complete","stats":{"total":2,"with_phone":1,"duration_seconds":12.5}}"#;
        let event = parse_event_line(line).unwrap().unwrap();
        let EventKind::Complete { stats, businesses } = event.kind else {
            panic!("expected complete event");
        };
        let stats = stats.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.with_email, 0);
        assert!(businesses.is_empty());
    }

    #[test]
    fn parses_stats_update_flat_fields() {
        let line = r#"{"type":"stats_update","total":4,"with_phone":3,"with_email":1}"#;
        let event = parse_event_line(line).unwrap().unwrap();
        let EventKind::StatsUpdate(stats) = event.kind else {
            panic!("expected stats_update");
        };
        assert_eq!(stats.total, 4);
        assert_eq!(stats.with_phone, 3);
    }

    #[test]
    fn unknown_type_is_ignored() {
        assert!(parse_event_line(r#"{"type":"zoom_start","zoom":15}"#).unwrap().is_none());
    }

    #[test]
    fn reserved_types_from_worker_are_ignored() {
        assert!(parse_event_line(r#"{"type":"ping"}"#).unwrap().is_none());
        assert!(
            parse_event_line(r#"{"type":"job","job_id":"00000000-0000-0000-0000-000000000000"}"#)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn truncated_line_is_malformed() {
        let err = parse_event_line(r#"{"type":"business","data":{"na"#).unwrap_err();
        assert!(matches!(err, MalformedEventError::NotJson(_)));
    }

    #[test]
    fn missing_type_is_malformed() {
        let err = parse_event_line(r#"{"message":"hello"}"#).unwrap_err();
        assert!(matches!(err, MalformedEventError::MissingType));
    }

    #[test]
    fn known_type_with_wrong_shape_is_malformed() {
        let err = parse_event_line(r#"{"type":"error"}"#).unwrap_err();
        match err {
            MalformedEventError::InvalidShape { event_type, .. } => assert_eq!(event_type, "error"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = Event {
            kind: EventKind::Error {
                message: "boom".to_string(),
            },
            timestamp: Some("t".to_string()),
            raw: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, serde_json::json!({"type": "error", "message": "boom", "timestamp": "t"}));
    }

    #[test]
    fn ping_serializes_to_bare_type() {
        let json = serde_json::to_value(Event::ping()).unwrap();
        assert_eq!(json["type"], "ping");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn terminal_events() {
        assert!(Event::error("x").is_terminal());
        assert!(
            Event::now(EventKind::Complete {
                stats: None,
                businesses: vec![]
            })
            .is_terminal()
        );
        assert!(!Event::ping().is_terminal());
        assert!(!Event::job(Uuid::new_v4()).is_terminal());
    }

    #[test]
    fn tally_respects_totals() {
        let mut a = business("A");
        a.phone = "0102030405".to_string();
        a.rating = Some(4.0);
        let mut b = business("B");
        b.website = "https://b.example".to_string();
        b.rating = Some(0.0);

        let stats = Stats::tally(&[a, b], 3, 12.34);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.with_phone, 1);
        assert_eq!(stats.with_website, 1);
        assert_eq!(stats.with_rating, 1);
        assert_eq!(stats.filtered_out, 3);
        assert_eq!(stats.duration_seconds, 12.3);
        assert!(stats.is_consistent());
    }

    #[test]
    fn inconsistent_stats_detected() {
        let stats = Stats {
            total: 1,
            with_email: 2,
            ..Default::default()
        };
        assert!(!stats.is_consistent());
    }

    #[test]
    fn identity_falls_back_to_name() {
        let mut record = business("Boulangerie");
        assert_eq!(record.identity(), "id-Boulangerie");
        record.place_id.clear();
        assert_eq!(record.identity(), "Boulangerie");
    }
}
