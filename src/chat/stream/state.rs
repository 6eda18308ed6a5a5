//! 连接状态与重连退避策略
//!
//! 状态转换都是纯函数，传输层只负责把结果写回连接注册表。

use std::time::Duration;

/// 指数退避重连策略：`delay = min(base · 2^attempt, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 连续重连次数上限，超过后上报终止错误
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// 第 `attempt` 次重连（从 0 开始）前的等待时间
    pub fn delay(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    /// 等待下一次重连
    Backoff,
    /// 正常关闭
    Closed,
    /// 超过重连上限或协议错误
    Failed,
}

/// 单个连接的状态（generation 用于丢弃被取代连接的迟到事件）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub generation: u64,
    /// 自上次成功打开以来的连续重连次数
    pub attempt: u32,
    pub status: ConnectionStatus,
}

impl ConnectionState {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            attempt: 0,
            status: ConnectionStatus::Idle,
        }
    }

    pub fn on_connecting(self) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            ..self
        }
    }

    /// 连接打开，重连计数清零
    pub fn on_open(self) -> Self {
        Self {
            attempt: 0,
            status: ConnectionStatus::Connected,
            ..self
        }
    }

    /// 传输错误：返回新状态和下一次重连前的等待时间，超过上限时为 `None`
    pub fn on_transport_error(self, policy: &ReconnectPolicy) -> (Self, Option<Duration>) {
        if self.attempt >= policy.max_attempts {
            return (
                Self {
                    status: ConnectionStatus::Failed,
                    ..self
                },
                None,
            );
        }
        let delay = policy.delay(self.attempt);
        (
            Self {
                attempt: self.attempt + 1,
                status: ConnectionStatus::Backoff,
                ..self
            },
            Some(delay),
        )
    }

    pub fn on_clean_close(self) -> Self {
        Self {
            status: ConnectionStatus::Closed,
            ..self
        }
    }

    pub fn on_fatal(self) -> Self {
        Self {
            status: ConnectionStatus::Failed,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..7).map(|a| policy.delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(policy.delay(64), Duration::from_millis(30_000));
    }

    #[test]
    fn five_reconnects_then_failed() {
        let policy = ReconnectPolicy::default();
        let mut state = ConnectionState::new(1).on_connecting();
        let mut delays = Vec::new();
        loop {
            let (next, delay) = state.on_transport_error(&policy);
            state = next;
            match delay {
                Some(d) => delays.push(d),
                None => break,
            }
        }
        assert_eq!(delays.len(), 5);
        assert_eq!(state.status, ConnectionStatus::Failed);
    }

    #[test]
    fn successful_open_resets_attempts() {
        let policy = ReconnectPolicy::default();
        let (state, _) = ConnectionState::new(3).on_transport_error(&policy);
        let (state, delay) = state.on_transport_error(&policy);
        assert_eq!(delay, Some(Duration::from_millis(2000)));
        assert_eq!(state.attempt, 2);

        let state = state.on_open();
        assert_eq!(state.attempt, 0);
        assert_eq!(state.generation, 3);
        let (_, delay) = state.on_transport_error(&policy);
        assert_eq!(delay, Some(Duration::from_millis(1000)));
    }
}
