//! 待发送队列：未确认的用户提交，保证最终送达

pub mod dao;
pub mod models;

pub use dao::PendingQueue;
pub use models::{PendingStatus, PendingSubmission, PlaceholderMessage};
