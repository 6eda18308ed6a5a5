//! 客户端状态观察：是否在流式接收、是否在补齐、是否已连接

use tokio::sync::watch;

/// 对外发布的状态快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStatus {
    /// 正在进行的流式发送/订阅连接数
    pub active_streams: usize,
    /// 正在进行的补齐次数
    pub active_syncs: usize,
    /// 已打开（收到 open）的连接数
    pub connected: usize,
}

impl ClientStatus {
    pub fn is_streaming(&self) -> bool {
        self.active_streams > 0
    }

    pub fn is_syncing(&self) -> bool {
        self.active_syncs > 0
    }

    pub fn is_connected(&self) -> bool {
        self.connected > 0
    }
}

/// 状态发布板（内部使用 `watch` 通道，订阅方总能拿到最新快照）
pub struct StatusBoard {
    tx: watch::Sender<ClientStatus>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ClientStatus::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientStatus> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ClientStatus {
        *self.tx.borrow()
    }

    pub(crate) fn stream_started(&self) {
        self.tx.send_modify(|s| s.active_streams += 1);
    }

    pub(crate) fn stream_finished(&self) {
        self.tx
            .send_modify(|s| s.active_streams = s.active_streams.saturating_sub(1));
    }

    pub(crate) fn sync_started(&self) {
        self.tx.send_modify(|s| s.active_syncs += 1);
    }

    pub(crate) fn sync_finished(&self) {
        self.tx
            .send_modify(|s| s.active_syncs = s.active_syncs.saturating_sub(1));
    }

    pub(crate) fn connection_opened(&self) {
        self.tx.send_modify(|s| s.connected += 1);
    }

    pub(crate) fn connection_closed(&self) {
        self.tx
            .send_modify(|s| s.connected = s.connected.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_never_underflow() {
        let board = StatusBoard::new();
        let rx = board.subscribe();
        board.stream_started();
        board.sync_started();
        assert!(rx.borrow().is_streaming());
        assert!(rx.borrow().is_syncing());

        board.stream_finished();
        board.stream_finished();
        board.sync_finished();
        board.connection_closed();
        assert_eq!(board.snapshot(), ClientStatus::default());
    }
}
