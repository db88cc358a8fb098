//! 客户端连接状态机（纯逻辑，不做 I/O）：
//! 1. 连上后先发 `auth`，收到 `auth:success` 前的写入全部排队，成功后按序冲刷。
//! 2. 心跳：连续未回应的 ping 达到上限即断开。
//! 3. 断线后按退避策略安排重连；鉴权失败与主动断开都是终态。

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use thiserror::Error;
use tl_shared_protocol::{WsMessage, WsMessageType};

use super::backoff::ReconnectPolicy;

/// 会话终止原因。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum TransportError {
    #[error("host rejected the access token")]
    AuthRejected,
    #[error("rate limited by host (retry after {retry_after_sec:?}s)")]
    RateLimited { retry_after_sec: Option<u64> },
    #[error("gave up after {attempts} reconnect attempts")]
    GaveUp { attempts: u32 },
}

/// 状态机阶段。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Phase {
    Connecting,
    Authenticating,
    Ready,
    Backoff,
    Closed,
}

/// 状态机要求驱动层执行的动作。
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    /// 发送一帧。
    Send(WsMessage),
    /// 交给上层处理的下行消息。
    Deliver(WsMessage),
    /// 关闭当前连接。
    Close,
    /// 等待后重连。
    Reconnect(Duration),
    /// 会话结束，不再重连。
    Stop(Option<TransportError>),
}

#[derive(Debug)]
pub(crate) struct ConnectionMachine {
    policy: ReconnectPolicy,
    max_missed_pongs: u32,
    token: String,
    phase: Phase,
    attempts: u32,
    missed_pongs: u32,
    queue: VecDeque<WsMessage>,
    /// 当前订阅，重连鉴权成功后重新发送。
    subscriptions: BTreeSet<String>,
}

impl ConnectionMachine {
    pub(crate) fn new(policy: ReconnectPolicy, max_missed_pongs: u32, token: &str) -> Self {
        Self {
            policy,
            max_missed_pongs: max_missed_pongs.max(1),
            token: token.to_string(),
            phase: Phase::Connecting,
            attempts: 0,
            missed_pongs: 0,
            queue: VecDeque::new(),
            subscriptions: BTreeSet::new(),
        }
    }

    pub(crate) fn phase(&self) -> &Phase {
        &self.phase
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 底层连接建立。
    pub(crate) fn on_open(&mut self) -> Vec<Action> {
        if self.phase == Phase::Closed {
            return vec![Action::Close];
        }
        self.phase = Phase::Authenticating;
        self.missed_pongs = 0;
        vec![Action::Send(WsMessage::auth(&self.token))]
    }

    /// 下行消息。
    pub(crate) fn on_message(&mut self, msg: WsMessage) -> Vec<Action> {
        match msg.kind {
            WsMessageType::AuthSuccess => {
                if self.phase != Phase::Authenticating {
                    return Vec::new();
                }
                self.phase = Phase::Ready;
                self.attempts = 0;
                self.missed_pongs = 0;
                let mut actions = self
                    .subscriptions
                    .iter()
                    .map(|id| {
                        Action::Send(WsMessage::new(
                            WsMessageType::Subscribe,
                            Some(id.clone()),
                            None,
                        ))
                    })
                    .collect::<Vec<_>>();
                actions.extend(self.queue.drain(..).map(Action::Send));
                actions
            }
            WsMessageType::AuthFailure => {
                self.phase = Phase::Closed;
                self.queue.clear();
                vec![
                    Action::Close,
                    Action::Stop(Some(TransportError::AuthRejected)),
                ]
            }
            WsMessageType::Pong => {
                self.missed_pongs = 0;
                Vec::new()
            }
            WsMessageType::Ping => vec![Action::Send(WsMessage::control(WsMessageType::Pong))],
            _ => vec![Action::Deliver(msg)],
        }
    }

    /// 上层写入；鉴权成功前排队。
    pub(crate) fn send(&mut self, msg: WsMessage) -> Vec<Action> {
        if self.phase == Phase::Closed {
            return Vec::new();
        }
        if let Some(pty_id) = msg.pty_id.clone() {
            match msg.kind {
                WsMessageType::Subscribe => {
                    self.subscriptions.insert(pty_id);
                }
                WsMessageType::Unsubscribe => {
                    self.subscriptions.remove(&pty_id);
                }
                _ => {}
            }
        }
        if self.phase == Phase::Ready {
            return vec![Action::Send(msg)];
        }
        // 重连后 subscribe 会按订阅集合重发，不再重复排队。
        if msg.kind != WsMessageType::Subscribe {
            self.queue.push_back(msg);
        }
        Vec::new()
    }

    /// 心跳定时器触发。
    pub(crate) fn on_ping_tick(&mut self) -> Vec<Action> {
        if self.phase != Phase::Ready {
            return Vec::new();
        }
        if self.missed_pongs >= self.max_missed_pongs {
            return vec![Action::Close];
        }
        self.missed_pongs += 1;
        vec![Action::Send(WsMessage::control(WsMessageType::Ping))]
    }

    /// 底层连接关闭或建立失败。
    pub(crate) fn on_closed(&mut self) -> Vec<Action> {
        if self.phase == Phase::Closed {
            return vec![Action::Stop(None)];
        }
        match self.policy.delay_for(self.attempts) {
            Some(delay) => {
                self.attempts += 1;
                self.phase = Phase::Backoff;
                vec![Action::Reconnect(delay)]
            }
            None => {
                let attempts = self.attempts;
                self.phase = Phase::Closed;
                vec![Action::Stop(Some(TransportError::GaveUp { attempts }))]
            }
        }
    }

    /// 宿主机以 HTTP 状态拒绝 WS 升级：401/403 与 429 都是终态，其余状态按断线重连。
    pub(crate) fn on_upgrade_rejected(
        &mut self,
        status: u16,
        retry_after_sec: Option<u64>,
    ) -> Vec<Action> {
        let err = match status {
            401 | 403 => TransportError::AuthRejected,
            429 => TransportError::RateLimited { retry_after_sec },
            _ => return self.on_closed(),
        };
        self.phase = Phase::Closed;
        self.queue.clear();
        vec![Action::Stop(Some(err))]
    }

    /// 退避结束，开始下一次连接。
    pub(crate) fn on_reconnect_due(&mut self) {
        if self.phase == Phase::Backoff {
            self.phase = Phase::Connecting;
        }
    }

    /// 主动断开：把重连次数推过上限并清空队列。
    pub(crate) fn disconnect(&mut self) -> Vec<Action> {
        self.attempts = self.policy.max_attempts.saturating_add(1);
        self.phase = Phase::Closed;
        self.queue.clear();
        vec![Action::Close]
    }
}
