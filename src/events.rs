use tokio::sync::broadcast;

/// Lifecycle and progress notifications, ordered per transfer id: `Added`
/// precedes `Started` precedes any `Progress` precedes exactly one terminal
/// event. No `Progress` follows a terminal event for the same id.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
  Added { id: String },
  Started { id: String },
  Paused { id: String },
  Resumed { id: String },
  Canceled { id: String },
  Completed { id: String },
  Failed { id: String, error: String },
  Progress { id: String, downloaded: i64, total: i64 },
  PostProcessWarning { id: String, message: String },
}

impl EngineEvent {
  pub fn transfer_id(&self) -> &str {
    match self {
      EngineEvent::Added { id }
      | EngineEvent::Started { id }
      | EngineEvent::Paused { id }
      | EngineEvent::Resumed { id }
      | EngineEvent::Canceled { id }
      | EngineEvent::Completed { id }
      | EngineEvent::Failed { id, .. }
      | EngineEvent::Progress { id, .. }
      | EngineEvent::PostProcessWarning { id, .. } => id,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      EngineEvent::Canceled { .. } | EngineEvent::Completed { .. } | EngineEvent::Failed { .. }
    )
  }
}

/// Broadcast fan-out to observers. The hub holds no observer state beyond
/// the channel, so dropping a receiver tears the observer down cleanly.
#[derive(Clone)]
pub struct EventHub {
  tx: broadcast::Sender<EngineEvent>,
}

impl EventHub {
  pub fn new() -> Self {
    // Small buffer; consumers should be fast. A lagging observer loses old
    // events rather than stalling the engine.
    let (tx, _) = broadcast::channel(512);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
    self.tx.subscribe()
  }

  pub fn emit(&self, event: EngineEvent) {
    let _ = self.tx.send(event);
  }
}

impl Default for EventHub {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn events_reach_every_subscriber() {
    let hub = EventHub::new();
    let mut a = hub.subscribe();
    let mut b = hub.subscribe();
    hub.emit(EngineEvent::Added { id: "x".into() });
    assert_eq!(a.recv().await.unwrap().transfer_id(), "x");
    assert_eq!(b.recv().await.unwrap().transfer_id(), "x");
  }

  #[test]
  fn emit_without_subscribers_is_silent() {
    let hub = EventHub::new();
    hub.emit(EngineEvent::Started { id: "y".into() });
  }
}
