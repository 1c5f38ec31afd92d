//! Command channel: durable queues with manual acknowledgment, and the
//! request/reply (RPC) layer built on top of them.

pub mod channel;
pub mod delivery;
pub mod in_memory;
pub mod pending;
pub mod rpc;

pub use channel::{ChannelError, CommandChannel, Feed, Subscription};
pub use delivery::{AckHandle, Acknowledger, Delivery};
pub use in_memory::InMemoryChannel;
pub use pending::{PendingCalls, PendingGuard, PendingSnapshot};
pub use rpc::{CallError, CommandSender, RpcClient, RpcConfig};
