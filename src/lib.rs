pub mod config;
pub mod decision;
pub mod error;
pub mod evaluator;
pub mod handlers;
pub mod host;
pub mod identity;
pub mod matcher;
pub mod middleware;
pub mod quota;
pub mod rules;
pub mod server;
pub mod store;

pub use config::{PluginConfig, Policy};
pub use decision::{Admission, Decision};
pub use error::{Error, Result};
pub use middleware::AdmissionState;
pub use server::create_app;
pub use store::{CounterStore, MemoryStore, RedisStore};
