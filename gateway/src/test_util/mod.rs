//! Helpers shared by unit and integration tests.

mod mock_provider;

pub use mock_provider::MockProvider;

use std::sync::Arc;

use crate::config::Config;
use crate::provider::ProviderClient;
use crate::AppState;

pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        openai_api_key: "test-key".to_string(),
        openai_base_url: "http://localhost:1".to_string(),
        environment: "test".to_string(),
        log_level: "debug".to_string(),
        ..Config::default()
    }
}

pub fn create_test_state(config: Config, provider: Arc<dyn ProviderClient>) -> Arc<AppState> {
    Arc::new(AppState::new(config, provider).expect("metrics registry"))
}
