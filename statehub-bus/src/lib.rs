//! Topic-based publish/subscribe for statehub.
//!
//! Publishing appends to an internal FIFO; a drain (manual or the delivery
//! loop) matches each event against subscriptions, orders them by priority
//! and applies each subscription's [`DeliveryPolicy`]. A failing or
//! panicking subscriber is logged and never affects other subscribers.

mod bus;
mod error;
mod replay;
mod subscription;
mod topic;

pub use bus::{BusConfig, BusStats, EventBus};
pub use error::{BusError, BusResult};
pub use subscription::{Callback, DeliveryPolicy, EventFilter, SubscribeOptions};
pub use topic::TopicPattern;
