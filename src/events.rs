use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

/// Events the core publishes towards the desktop UI.
///
/// Payloads are serialisable as-is; the bridge forwards them verbatim.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum CoreEvent {
    #[serde(rename_all = "camelCase")]
    FileTreeChanged { root: String, changed: Vec<String> },
    #[serde(rename_all = "camelCase")]
    ContextProgress {
        context_id: String,
        current: usize,
        total: usize,
    },
    #[serde(rename_all = "camelCase")]
    ContextReady {
        context_id: String,
        name: String,
        file_count: usize,
        token_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    ContextError {
        context_id: Option<String>,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    SymbolIndexBuilt {
        root: String,
        files: usize,
        symbols: usize,
        reparsed: usize,
    },
    #[serde(rename_all = "camelCase")]
    CallGraphBuilt {
        root: String,
        nodes: usize,
        edges: usize,
    },
}

impl CoreEvent {
    /// Wire name of the event as the UI consumer expects it.
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::FileTreeChanged { .. } => "fileTreeChanged",
            CoreEvent::ContextProgress { .. } => "shotgunContextGenerationProgress",
            CoreEvent::ContextReady { .. } => "contextReady",
            CoreEvent::ContextError { .. } => "contextError",
            CoreEvent::SymbolIndexBuilt { .. } => "symbolIndexBuilt",
            CoreEvent::CallGraphBuilt { .. } => "callGraphBuilt",
        }
    }
}

/// Fire-and-forget adapter in front of the external event bus.
///
/// `publish` never blocks a core operation: the channel is bounded and a full
/// (or disconnected) channel drops the event, incrementing a counter that the
/// stats surface reports.
#[derive(Clone)]
pub struct EventBus {
    tx: Option<SyncSender<CoreEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// A bus with a bounded queue; the receiver side belongs to the bridge.
    pub fn bounded(capacity: usize) -> (Self, Receiver<CoreEvent>) {
        let (tx, rx) = sync_channel(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// A bus with no consumer; every publish is counted as dropped.
    /// Used by CLI paths that do not stream events.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn publish(&self, event: CoreEvent) {
        let Some(tx) = &self.tx else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(ev)) | Err(TrySendError::Disconnected(ev)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("event bus dropped `{}`", ev.name());
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_delivers_in_order() {
        let (bus, rx) = EventBus::bounded(8);
        for current in 1..=3 {
            bus.publish(CoreEvent::ContextProgress {
                context_id: "stream_1".into(),
                current,
                total: 3,
            });
        }
        for expected in 1..=3 {
            match rx.recv().unwrap() {
                CoreEvent::ContextProgress { current, total, .. } => {
                    assert_eq!(current, expected);
                    assert_eq!(total, 3);
                }
                other => panic!("unexpected event {}", other.name()),
            }
        }
        assert_eq!(bus.dropped_count(), 0);
    }

    #[test]
    fn full_channel_drops_and_counts_instead_of_blocking() {
        let (bus, _rx) = EventBus::bounded(1);
        bus.publish(CoreEvent::ContextError {
            context_id: None,
            message: "first".into(),
        });
        bus.publish(CoreEvent::ContextError {
            context_id: None,
            message: "second".into(),
        });
        assert_eq!(bus.dropped_count(), 1);
    }

    #[test]
    fn wire_names_match_the_ui_contract() {
        let ev = CoreEvent::ContextProgress {
            context_id: "stream_9".into(),
            current: 1,
            total: 2,
        };
        assert_eq!(ev.name(), "shotgunContextGenerationProgress");
        let ev = CoreEvent::ContextReady {
            context_id: "stream_9".into(),
            name: "sel".into(),
            file_count: 1,
            token_count: 10,
        };
        assert_eq!(ev.name(), "contextReady");
    }
}
