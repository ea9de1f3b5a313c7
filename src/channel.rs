//! Outbound channel dispatch: a registry of pluggable, reentrant senders.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::agent_response::AgentResponse;

/// Outcome of attempting to dispatch a single response.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// `true` if the dispatcher accepted the response.
    pub success: bool,
    /// Failure detail, present iff `success` is `false`.
    pub error: Option<String>,
}

impl DeliveryResult {
    /// A successful delivery.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// A failed delivery carrying `message`.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

/// A concrete outbound transport (websocket, email, SMS, ...). Must be
/// reentrant: the same dispatcher is invoked concurrently for different
/// patients.
#[async_trait]
pub trait ChannelDispatcher: Send + Sync {
    /// Attempts to deliver `response`. Must never panic on a delivery
    /// failure; return a failed [`DeliveryResult`] instead.
    async fn send(&self, response: &AgentResponse) -> DeliveryResult;
}

/// Maps channel names to their dispatcher implementations.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    dispatchers: HashMap<String, Arc<dyn ChannelDispatcher>>,
}

impl ChannelRegistry {
    /// Registers `dispatcher` under `channel`, replacing any prior registration.
    pub fn register(&mut self, channel: impl Into<String>, dispatcher: Arc<dyn ChannelDispatcher>) {
        self.dispatchers.insert(channel.into(), dispatcher);
    }

    /// Dispatches a single response. Never raises: an unknown channel or a
    /// dispatcher failure both yield a failed [`DeliveryResult`].
    pub async fn dispatch(&self, response: &AgentResponse) -> DeliveryResult {
        match self.dispatchers.get(&response.channel) {
            Some(dispatcher) => dispatcher.send(response).await,
            None => DeliveryResult::failure(format!("No dispatcher for channel {}", response.channel)),
        }
    }

    /// Dispatches every response, preserving order. Partial failures never
    /// short-circuit the rest of the batch.
    pub async fn dispatch_all(&self, responses: &[AgentResponse]) -> Vec<DeliveryResult> {
        let mut results = Vec::with_capacity(responses.len());
        for response in responses {
            results.push(self.dispatch(response).await);
        }
        results
    }

    /// Names of every registered channel, for health reporting.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.dispatchers.keys().cloned().collect()
    }

    /// `true` iff a dispatcher is registered under `channel`.
    #[must_use]
    pub fn is_registered(&self, channel: &str) -> bool {
        self.dispatchers.contains_key(channel)
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    /// `true` if no channels are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFails;

    #[async_trait]
    impl ChannelDispatcher for AlwaysFails {
        async fn send(&self, _response: &AgentResponse) -> DeliveryResult {
            DeliveryResult::failure("transport down")
        }
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl ChannelDispatcher for AlwaysSucceeds {
        async fn send(&self, _response: &AgentResponse) -> DeliveryResult {
            DeliveryResult::ok()
        }
    }

    #[tokio::test]
    async fn unregistered_channel_fails_without_panicking() {
        let registry = ChannelRegistry::default();
        let response = AgentResponse::new("PT-1", "carrier_pigeon", "hi");
        let result = registry.dispatch(&response).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("carrier_pigeon"));
    }

    #[tokio::test]
    async fn dispatch_all_preserves_order_despite_partial_failure() {
        let mut registry = ChannelRegistry::default();
        registry.register("sms", Arc::new(AlwaysFails));
        registry.register("websocket", Arc::new(AlwaysSucceeds));

        let responses = vec![
            AgentResponse::new("PT-1", "sms", "a"),
            AgentResponse::new("PT-1", "websocket", "b"),
        ];
        let results = registry.dispatch_all(&responses).await;
        assert!(!results[0].success);
        assert!(results[1].success);
    }
}
