//! # Taskbus Bus
//!
//! In-process publish/subscribe message bus.
//!
//! ## Routing
//! ```text
//! publish("agent:failure", data)
//!   ├── allow-list check (exact entry wins, then longest wildcard)
//!   ├── wrap: Message { data, metadata { id, timestamp, channel, .. } }
//!   ├── optional history append (bounded per channel, swept by age)
//!   └── deliver: exact subscribers, then "agent:*" style wildcards
//!
//! request("math:double", 21)
//!   ├── subscribe once to "reply:<uuid>"
//!   ├── publish with metadata.responseChannel = "reply:<uuid>"
//!   └── await reply or timeout; the reply subscription is always removed
//! ```

pub mod bus;
pub mod history;
pub mod matcher;
pub mod message;

pub use bus::{
    BusStats, Handler, HistoryQuery, MessageBus, PublishOptions, REPLY_PREFIX, RequestOptions,
    SubscribeOptions, SubscriptionInfo,
};
pub use history::MessageHistory;
pub use matcher::{is_pattern, matches};
pub use message::{Message, MessageMetadata};
