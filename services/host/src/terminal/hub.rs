//! 终端输出分发：发布者只做 `try_send`，永不等待消费者。
//!
//! 无订阅者时输出进入定长环形缓冲（丢弃最旧），首个订阅者到来时按序取走并清空。

use std::collections::{HashMap, VecDeque};

use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use uuid::Uuid;

/// 推给订阅者的终端事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HubEvent {
    Data { pty_id: String, data: String },
    Exit { pty_id: String, exit_code: Option<i32> },
}

#[derive(Default)]
struct TerminalChannel {
    subscribers: HashMap<Uuid, mpsc::Sender<HubEvent>>,
    backlog: VecDeque<HubEvent>,
}

pub(crate) struct TerminalHub {
    channels: Mutex<HashMap<String, TerminalChannel>>,
    backlog_cap: usize,
}

impl TerminalHub {
    pub(crate) fn new(backlog_cap: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            backlog_cap: backlog_cap.max(1),
        }
    }

    /// 终端创建时登记。
    pub(crate) async fn register(&self, pty_id: &str) {
        self.channels
            .lock()
            .await
            .entry(pty_id.to_string())
            .or_default();
    }

    pub(crate) async fn publish(&self, pty_id: &str, data: String) {
        let event = HubEvent::Data {
            pty_id: pty_id.to_string(),
            data,
        };
        self.dispatch(pty_id, event).await;
    }

    pub(crate) async fn publish_exit(&self, pty_id: &str, exit_code: Option<i32>) {
        let event = HubEvent::Exit {
            pty_id: pty_id.to_string(),
            exit_code,
        };
        self.dispatch(pty_id, event).await;
    }

    async fn dispatch(&self, pty_id: &str, event: HubEvent) {
        let mut channels = self.channels.lock().await;
        let Some(channel) = channels.get_mut(pty_id) else {
            return;
        };
        if channel.subscribers.is_empty() {
            if channel.backlog.len() >= self.backlog_cap {
                channel.backlog.pop_front();
            }
            channel.backlog.push_back(event);
            return;
        }
        channel
            .subscribers
            .retain(|subscriber, sender| match sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(pty_id, %subscriber, "subscriber queue full, chunk dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
    }

    /// 订阅终端输出；返回积压事件（调用方需先于通道内事件发送）。终端不存在时返回 None。
    pub(crate) async fn subscribe(
        &self,
        pty_id: &str,
        subscriber: Uuid,
        sender: mpsc::Sender<HubEvent>,
    ) -> Option<Vec<HubEvent>> {
        let mut channels = self.channels.lock().await;
        let channel = channels.get_mut(pty_id)?;
        channel.subscribers.insert(subscriber, sender);
        Some(channel.backlog.drain(..).collect())
    }

    pub(crate) async fn unsubscribe(&self, pty_id: &str, subscriber: Uuid) {
        if let Some(channel) = self.channels.lock().await.get_mut(pty_id) {
            channel.subscribers.remove(&subscriber);
        }
    }

    /// 连接关闭时移除该订阅者的全部订阅。
    pub(crate) async fn unsubscribe_all(&self, subscriber: Uuid) {
        for channel in self.channels.lock().await.values_mut() {
            channel.subscribers.remove(&subscriber);
        }
    }

    /// 终端销毁：丢弃积压与订阅关系。
    pub(crate) async fn remove(&self, pty_id: &str) {
        self.channels.lock().await.remove(pty_id);
    }

    #[cfg(test)]
    pub(crate) async fn backlog_len(&self, pty_id: &str) -> usize {
        self.channels
            .lock()
            .await
            .get(pty_id)
            .map(|channel| channel.backlog.len())
            .unwrap_or_default()
    }
}
