pub mod chat;

// 重新导出常用类型，方便外部使用
pub use chat::{
    client::{ClientConfig, SubmitOutcome, SyncController, TimelineItem},
    error::SyncError,
    message::{ConfirmedMessage, CursorStatus, Role, SyncCursor},
    pending::{PendingSubmission, PlaceholderMessage},
    stream::{EmptyStreamListener, ReconnectPolicy, StreamListener},
    StaticTokenProvider, TokenProvider,
};
