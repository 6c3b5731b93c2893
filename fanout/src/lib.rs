//! Broadcast fan-out queue: one stream of items, copied to any number of
//! subscribers that come and go while it runs.
//!
//! Every subscriber reads every item published after it subscribed, in
//! publish order, at its own pace. Flow control is per subscriber: a full
//! subscriber parks the publisher instead of losing items.

mod queue;
mod ring;
mod subscriber;

pub use queue::BroadcastQueue;
pub use subscriber::Subscriber;
