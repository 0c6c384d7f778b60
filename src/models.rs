use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Event record ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Client,
    Connection,
    Onvif,
    User,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    #[serde(rename = "self")]
    Local,
    Server,
    Other,
}

/// A validated event. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Unique per emission.
    pub id: String,
    pub kind: EventKind,
    /// e.g. "disconnected", "zero_client", "kill", "motion"
    pub name: String,
    pub source: EventSource,
    /// As stamped by the emitter. Informational; the ledger ages events by
    /// local receive time.
    pub timestamp: DateTime<Utc>,
    pub payload: Map<String, Value>,
}

impl Event {
    /// Build an event raised by this agent itself.
    pub fn local(kind: EventKind, name: &str) -> Self {
        static SEQ: AtomicU64 = AtomicU64::new(0);

        let timestamp = Utc::now();
        Self {
            id: format!(
                "local-{}-{name}-{}-{}",
                kind.as_str(),
                timestamp.timestamp_millis(),
                SEQ.fetch_add(1, Ordering::Relaxed)
            ),
            kind,
            name: name.to_owned(),
            source: EventSource::Local,
            timestamp,
            payload: Map::new(),
        }
    }

    /// String field from the payload, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Client => "client",
            EventKind::Connection => "connection",
            EventKind::Onvif => "onvif",
            EventKind::User => "user",
            EventKind::Custom => "custom",
        }
    }
}

// ── Inbound wire shapes ─────────────────────────────────────────

/// Event exactly as the coordination server sends it.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    pub id: String,
    pub event: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub source: EventSource,
    pub timestamp: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl TryFrom<InboundEvent> for Event {
    type Error = anyhow::Error;

    fn try_from(raw: InboundEvent) -> anyhow::Result<Self> {
        if raw.id.is_empty() {
            anyhow::bail!("event without id");
        }
        if raw.event.is_empty() {
            anyhow::bail!("event {} has an empty name", raw.id);
        }

        let timestamp = DateTime::parse_from_rfc3339(&raw.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .or_else(|_| {
                // Naive timestamps are taken as UTC
                chrono::NaiveDateTime::parse_from_str(&raw.timestamp, "%Y-%m-%dT%H:%M:%S%.f")
                    .map(|t| t.and_utc())
            })
            .map_err(|e| anyhow::anyhow!("event {} has a bad timestamp {:?}: {e}", raw.id, raw.timestamp))?;

        Ok(Event {
            id: raw.id,
            kind: raw.kind,
            name: raw.event,
            source: raw.source,
            timestamp,
            payload: raw.data,
        })
    }
}

/// Older broadcast frame: `{"type":"broadcast","message":"kill","killType":"x"}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Broadcast {
    message: String,
    kill_type: Option<String>,
}

/// Parse one text frame from the server into an event.
///
/// Returns `Ok(None)` for frames that are valid JSON but carry nothing for
/// the core (server heartbeats, acks).
pub fn parse_frame(text: &str) -> anyhow::Result<Option<Event>> {
    let value: Value = serde_json::from_str(text)?;

    match value.get("type").and_then(Value::as_str) {
        Some("broadcast") => {
            let b: Broadcast = serde_json::from_value(value)?;
            let mut event = match b.message.as_str() {
                "kill" => Event::local(EventKind::User, "kill"),
                "movement" => Event::local(EventKind::Onvif, "motion"),
                other => anyhow::bail!("unknown broadcast message {other:?}"),
            };
            event.source = EventSource::Server;
            if let Some(profile) = b.kill_type {
                event.payload.insert("profile".into(), Value::String(profile));
            }
            Ok(Some(event))
        }
        Some("heartbeat") | Some("ack") => Ok(None),
        _ => {
            let raw: InboundEvent = serde_json::from_value(value)?;
            Ok(Some(Event::try_from(raw)?))
        }
    }
}

// ── Outbound payloads ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "type")]
    pub kind: String,
    pub hostname: String,
    pub ip: String,
    pub client: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ack<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: &'a str,
}

// ── API responses ───────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub hostname: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub current_alert: Option<String>,
    pub alerting: bool,
    pub active_events: usize,
    pub camera_connected: bool,
    pub frame_age_ms: Option<u128>,
    pub recorder_connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_event() {
        let text = r#"{
            "id": "e-1",
            "event": "disconnected",
            "type": "connection",
            "source": "self",
            "timestamp": "2026-10-19T08:00:00.250Z",
            "data": {"reason": "timeout"}
        }"#;

        let event = parse_frame(text).unwrap().unwrap();
        assert_eq!(event.id, "e-1");
        assert_eq!(event.kind, EventKind::Connection);
        assert_eq!(event.name, "disconnected");
        assert_eq!(event.source, EventSource::Local);
        assert_eq!(event.data_str("reason"), Some("timeout"));
    }

    #[test]
    fn accepts_naive_timestamp() {
        let text = r#"{"id":"e-2","event":"motion","type":"onvif","source":"server",
                       "timestamp":"2026-10-19T08:00:00.123456"}"#;
        let event = parse_frame(text).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Onvif);
        assert!(event.payload.is_empty());
    }

    #[test]
    fn translates_broadcast_kill() {
        let text = r#"{"type":"broadcast","message":"kill","killType":"exam"}"#;
        let event = parse_frame(text).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::User);
        assert_eq!(event.name, "kill");
        assert_eq!(event.source, EventSource::Server);
        assert_eq!(event.data_str("profile"), Some("exam"));
    }

    #[test]
    fn ignores_server_heartbeat() {
        assert!(parse_frame(r#"{"type":"heartbeat"}"#).unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_kind_and_bad_timestamp() {
        let unknown = r#"{"id":"x","event":"y","type":"weird","source":"server","timestamp":"2026-10-19T08:00:00Z"}"#;
        assert!(parse_frame(unknown).is_err());

        let bad_ts = r#"{"id":"x","event":"y","type":"user","source":"server","timestamp":"yesterday"}"#;
        assert!(parse_frame(bad_ts).is_err());

        assert!(parse_frame("not json").is_err());
    }
}
