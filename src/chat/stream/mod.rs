//! 流式连接模块
//!
//! 远端接口、SSE 事件解析、连接状态机和传输层

pub mod api;
pub mod events;
pub mod listener;
pub mod state;
pub mod transport;

pub use api::{ConversationRemote, HttpConversationApi, StreamRequest, WireFrame, WireStream};
pub use events::{parse_event, EventGuard, StreamEvent};
pub use listener::{EmptyStreamListener, StreamListener};
pub use state::{ConnectionState, ConnectionStatus, ReconnectPolicy};
pub use transport::{ConnectionHandle, StreamTransport};
