pub mod schema;

pub use schema::{
    is_valid_agent_name, AgentConfig, BackoffStrategy, CategoryPolicyConfig, Config, Coordinates,
    DedupConfig, DeliveryConfig, HealthConfig, JournalConfig, QueueConfig, RetryConfig,
    RouterConfig, ThrottleConfig, TransportKind,
};
