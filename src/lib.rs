pub mod bucket_key;
pub mod config;
pub mod degrade;
pub mod error;
pub mod executor;
pub mod header_learner;
pub mod health;
pub mod metrics;
pub mod response;
pub mod retry;
pub mod store;
pub mod token_bucket;
pub mod transport;

pub use bucket_key::{BucketKey, BucketKeyClassifier};
pub use config::Config;
pub use error::{CallFailure, Error, Result, TransportError};
pub use executor::ResilientExecutor;
pub use header_learner::HeaderLearner;
pub use response::ApiResponse;
pub use store::{Backend, BudgetStore, MemoryStore, RedisStore};
pub use token_bucket::{BucketPolicy, BucketSource, RateBucket};
pub use transport::{ApiRequest, ReqwestTransport, Transport};
