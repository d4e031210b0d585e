pub mod schema;

pub use schema::{
    Config, DiscordConfig, RateLimitConfig, RateLimitsConfig, RetentionConfig, StoreConfig,
};
