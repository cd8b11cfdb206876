//! Worker configuration: TOML file, `KILN_*` environment overrides, validation.

mod loading;
mod types;
mod validation;

pub use loading::load_dotenv;
pub use types::{
    BackendConfig, BrokerConfig, BrokerKind, CacheConfig, DispatchConfig, KilnConfig,
    ModelConfig, RetryConfig, SinkConfig, SqsConfig,
};
