//! Play history and slot events
//!
//! Sinks are fire-and-forget: they must return quickly and never fail the
//! audio path.

use std::fmt;

use serde::Serialize;

/// Slot lifecycle milestones worth recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotEventKind {
    Started,
    Connected,
    Reconnected,
    Reconnecting,
    Sleep,
    Stopped,
    Error,
}

impl fmt::Display for SlotEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotEventKind::Started => "started",
            SlotEventKind::Connected => "connected",
            SlotEventKind::Reconnected => "reconnected",
            SlotEventKind::Reconnecting => "reconnecting",
            SlotEventKind::Sleep => "sleep",
            SlotEventKind::Stopped => "stopped",
            SlotEventKind::Error => "error",
        };
        f.write_str(name)
    }
}

pub trait MetricsSink: Send + Sync {
    /// A track started playing on `slot_id`
    fn record_play(&self, title: &str, artist: &str, slot_id: u32, listeners: u32);

    fn record_event(&self, slot_id: u32, mount: &str, kind: SlotEventKind);
}

/// Writes metrics as structured log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_play(&self, title: &str, artist: &str, slot_id: u32, listeners: u32) {
        tracing::info!(
            target: "relaycast::metrics",
            slot = slot_id,
            listeners,
            "play: {} - {}",
            artist,
            title
        );
    }

    fn record_event(&self, slot_id: u32, mount: &str, kind: SlotEventKind) {
        tracing::info!(target: "relaycast::metrics", slot = slot_id, mount, "event: {}", kind);
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn record_play(&self, _: &str, _: &str, _: u32, _: u32) {}

    fn record_event(&self, _: u32, _: &str, _: SlotEventKind) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(SlotEventKind::Reconnected.to_string(), "reconnected");
        assert_eq!(
            serde_json::to_string(&SlotEventKind::Sleep).unwrap(),
            "\"sleep\""
        );
    }

    #[test]
    fn test_sinks_are_object_safe() {
        let sinks: Vec<Box<dyn MetricsSink>> = vec![Box::new(TracingMetrics), Box::new(NullMetrics)];
        for sink in &sinks {
            sink.record_play("Title", "Artist", 1, 0);
            sink.record_event(1, "/live", SlotEventKind::Started);
        }
    }
}
