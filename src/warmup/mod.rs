//! Warmup orchestration: per-instance loops that send human-like traffic.

pub mod behavior;
pub mod content;
pub mod dispatcher;
pub mod inbound;
pub mod rate_limit;
pub mod sampler;
pub mod scheduler;
pub mod state;
pub mod stats;

pub use behavior::{BehaviorModel, Target};
pub use content::{Content, ContentLibrary, MediaItem, MessageType};
pub use dispatcher::MessageDispatcher;
pub use inbound::WebhookEvent;
pub use rate_limit::{LimitCheck, RateLimiter};
pub use sampler::WeightedSampler;
pub use scheduler::{InstanceScheduler, RunningInstance, SchedulerOptions};
pub use state::{WarmupInstanceState, WarmupStatus};
pub use stats::{DailyKey, DeliverySignal, MediaStatsDaily};
