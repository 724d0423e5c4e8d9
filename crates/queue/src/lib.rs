//! Delayed batching queue for huddle.
//!
//! Events addressed to the same recipient and merge key are accumulated in
//! Redis for a short window and delivered as one batch:
//!
//! - **Store**: the handful of Redis primitives the queue relies on
//! - **Schedule**: sorted index of when each batch becomes due
//! - **Repository**: push, claim, complete and release of batches
//! - **Dispatcher**: polling loop that drains due batches into a sink
//! - **Retry**: exponential backoff for failed deliveries
//! - **Routing**: maps batch keys to downstream services
//! - **Delayed / Instant**: the queue front-ends exposed over HTTP

pub mod claim;
pub mod delayed;
pub mod dispatcher;
pub mod instant;
pub mod push;
pub mod repository;
pub mod retry;
pub mod routing;
pub mod schedule;
pub mod store;

pub use claim::{BatchKeys, Claim, ClaimOutcome, Completion};
pub use delayed::{DelayedQueue, head_namespace};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherState, Sink, SinkOutcome};
pub use instant::InstantQueue;
pub use push::{PushArg, Recipient};
pub use repository::Repository;
pub use retry::{Backoff, RetryConfig};
pub use routing::{
    HttpServiceClient, RouteError, RouteKey, RoutingSink, ServiceClient, ServiceError, Services,
};
pub use schedule::{ScheduleEntry, ScheduleIndex, SchedulePolicy, unix_now};
pub use store::{MemoryStore, RedisStore, Store, StoreError, StoreResult};
