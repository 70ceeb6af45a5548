//! Failover: target ordering, warm standby, preferred host, recovery and
//! subscription replay

pub mod connection_list;
pub mod preferred_host;
mod recovery;
pub mod subscriptions;
pub mod warm_standby;

pub use connection_list::{TargetCursor, TargetOrigin, TargetSlot};
pub use preferred_host::PreferredHost;
pub use subscriptions::{OpenRequest, SubscriptionBook};
pub use warm_standby::WarmStandbyState;
