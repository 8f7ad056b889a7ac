// Declare modules within the adapters directory
pub mod in_memory_cache;
pub mod in_memory_identity;
pub mod in_memory_notifier;
pub mod in_memory_store;
pub mod postgres_store;
pub mod provider_notifier;
pub mod redis_cache;
pub mod retry;
pub mod smtp_email;
pub mod supabase_identity;
pub mod twilio_sms;

pub use in_memory_cache::InMemoryCache;
pub use in_memory_identity::InMemoryIdentityProvider;
pub use in_memory_notifier::InMemoryNotifier;
pub use in_memory_store::InMemoryStore;
pub use postgres_store::PostgresStore;
pub use provider_notifier::ProviderNotifier;
pub use redis_cache::RedisCache;
pub use retry::{RetryPolicy, RetryingIdentityProvider};
