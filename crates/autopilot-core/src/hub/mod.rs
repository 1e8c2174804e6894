//! Hub - イベントハブ（in-process / broker 経由の publish/subscribe）

mod event_hub;
mod handler;

pub use event_hub::{DeliveryMode, EventHub, SubscriptionId};
pub use handler::{EventHandler, FnHandler, handler_fn};
