//! Process-wide usage event bus.
//!
//! One broadcast channel per runtime; the inference layer publishes a
//! [`UsageEvent`] after every successful completion. Subscribers that fall
//! behind lose oldest events (accounting is best-effort by design), and
//! publishing without subscribers is not an error.

use smyth_core::usage::{USAGE_LLM_CHANNEL, UsageEvent};
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct UsageBus {
    tx: broadcast::Sender<UsageEvent>,
}

impl Default for UsageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Channel name, for adapters that re-publish onto an external bus.
    pub fn channel(&self) -> &'static str {
        USAGE_LLM_CHANNEL
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UsageEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: UsageEvent) {
        if self.tx.send(event).is_err() {
            log::debug!(target: "usage", "no subscribers on {USAGE_LLM_CHANNEL}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smyth_core::llm::LlmUsage;
    use smyth_core::usage::KeySource;

    #[tokio::test(flavor = "current_thread")]
    async fn test_publish_subscribe() {
        let bus = UsageBus::new();
        let mut rx = bus.subscribe();
        bus.publish(UsageEvent::for_model(
            "gpt-test",
            &LlmUsage {
                input_tokens: 10,
                output_tokens: 3,
                ..Default::default()
            },
            KeySource::Smyth,
        ));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.source_id, "llm:gpt-test");
        assert_eq!(ev.input_tokens, 10);
        assert_eq!(bus.channel(), "USAGE:LLM");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = UsageBus::new();
        bus.publish(UsageEvent::for_model(
            "gpt-test",
            &LlmUsage::default(),
            KeySource::Smyth,
        ));
    }
}
