use std::sync::Arc;

use anyhow::Context;

use crate::call_control::{SharedCallControl, create_call_control};
use crate::config::ServerConfig;
use crate::core::realtime::{OpenAIRealtimeFactory, RealtimeFactory};
use crate::core::registry::SessionRegistry;
use crate::handlers::media_stream::CallBridge;
use crate::storage::{SharedConversationStore, create_conversation_store};

/// Application state that can be shared across handlers
pub struct AppState {
    pub config: ServerConfig,
    /// Live calls, consulted by the health endpoint and the connection limit
    pub registry: Arc<SessionRegistry>,
    pub bridge: Arc<CallBridge>,
}

impl AppState {
    /// Build the production state: OpenAI backend, configured storage and
    /// Twilio call control.
    pub fn new(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let factory = OpenAIRealtimeFactory::new(config.realtime_config())
            .context("Realtime backend configuration")?;
        let store =
            create_conversation_store(&config).context("Conversation storage configuration")?;
        let call_control = create_call_control(&config);

        Ok(Self::with_components(
            config,
            Arc::new(factory),
            store,
            call_control,
        ))
    }

    /// Build the state around explicit collaborators.
    pub fn with_components(
        config: ServerConfig,
        factory: Arc<dyn RealtimeFactory>,
        store: SharedConversationStore,
        call_control: SharedCallControl,
    ) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        let bridge = Arc::new(CallBridge::new(
            registry.clone(),
            factory,
            store,
            call_control,
            config.codec(),
            config.bridge_settings(),
        ));

        Arc::new(Self {
            config,
            registry,
            bridge,
        })
    }

    /// Number of calls currently bridged
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_api_key() {
        let config = ServerConfig::default();
        let err = AppState::new(config).err().unwrap();
        assert_eq!(err.to_string(), "Realtime backend configuration");
        assert!(format!("{err:#}").contains("API key"));
    }

    #[test]
    fn test_new_with_api_key() {
        let mut config = ServerConfig::default();
        config.openai_api_key = Some("sk-test".to_string());
        config.max_sessions = Some(5);

        let state = AppState::new(config).unwrap();
        assert_eq!(state.active_sessions(), 0);
        assert_eq!(state.registry.max_sessions(), Some(5));
        assert_eq!(state.bridge.settings().placeholder_timeout.as_millis(), 2000);
    }
}
