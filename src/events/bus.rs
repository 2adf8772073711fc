//! 按会话划分的事件总线
//!
//! - 每个会话一个环形历史缓冲，重连的订阅者可从指定序号之后回放，再接实时事件
//! - 发布是同步的，没有订阅者时也不会阻塞
//! - 每个订阅者有独立的有界缓冲，满了丢最旧的，不拖慢发布者和其它订阅者

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::Stream;
use tokio::sync::Notify;

use super::event::{EventType, ProgressUpdate, StreamEvent};

/// 单个订阅者的有界缓冲
struct SubscriberQueue {
    id: u64,
    buffer: Mutex<VecDeque<StreamEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<StreamEvent>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, event: StreamEvent) {
        {
            let mut buffer = self.lock();
            if buffer.len() >= self.capacity {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(subscriber = self.id, "Subscriber buffer full, dropped oldest event");
            }
            buffer.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<StreamEvent> {
        self.lock().pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// 单个会话的流
struct Channel {
    next_sequence: u64,
    history: VecDeque<StreamEvent>,
    subscribers: Vec<Arc<SubscriberQueue>>,
    /// 最近一次发布或订阅的时间
    last_activity: DateTime<Utc>,
}

impl Channel {
    fn new() -> Self {
        Self {
            next_sequence: 1,
            history: VecDeque::new(),
            subscribers: Vec::new(),
            last_activity: Utc::now(),
        }
    }

    fn has_live_subscribers(&self) -> bool {
        self.subscribers.iter().any(|s| !s.is_closed())
    }
}

type ChannelRef = Arc<Mutex<Channel>>;

fn lock_channel(channel: &ChannelRef) -> MutexGuard<'_, Channel> {
    channel.lock().unwrap_or_else(|e| e.into_inner())
}

/// 事件总线
pub struct EventBus {
    channels: DashMap<String, ChannelRef>,
    history_size: usize,
    subscriber_buffer: usize,
    next_subscriber_id: AtomicU64,
}

impl EventBus {
    pub fn new(history_size: usize, subscriber_buffer: usize) -> Self {
        Self {
            channels: DashMap::new(),
            history_size: history_size.max(1),
            subscriber_buffer: subscriber_buffer.max(1),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    fn channel(&self, conversation_id: &str) -> ChannelRef {
        Arc::clone(
            self.channels
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Channel::new())))
                .value(),
        )
    }

    /// 发布事件，分配序号并写入历史；返回带序号的事件
    pub fn publish(
        &self,
        conversation_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> StreamEvent {
        let channel = self.channel(conversation_id);
        let mut channel = lock_channel(&channel);

        let event = StreamEvent {
            conversation_id: conversation_id.to_string(),
            sequence: channel.next_sequence,
            event_type,
            payload,
            timestamp: Utc::now(),
        };
        channel.next_sequence += 1;
        channel.last_activity = event.timestamp;

        channel.history.push_back(event.clone());
        while channel.history.len() > self.history_size {
            channel.history.pop_front();
        }

        channel.subscribers.retain(|s| !s.is_closed());
        for subscriber in &channel.subscribers {
            subscriber.push(event.clone());
        }

        event
    }

    /// 发布一条 ProgressUpdate
    pub fn publish_progress(
        &self,
        conversation_id: &str,
        event_type: EventType,
        update: &ProgressUpdate,
    ) -> StreamEvent {
        let payload = serde_json::to_value(update).unwrap_or(serde_json::Value::Null);
        self.publish(conversation_id, event_type, payload)
    }

    /// 订阅：先回放历史（after_sequence 之后的，None 表示全部），再接实时事件
    pub fn subscribe(&self, conversation_id: &str, after_sequence: Option<u64>) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(id, self.subscriber_buffer));

        let channel = self.channel(conversation_id);
        let mut channel = lock_channel(&channel);

        let after = after_sequence.unwrap_or(0);
        let replay: VecDeque<StreamEvent> = channel
            .history
            .iter()
            .filter(|e| e.sequence > after)
            .cloned()
            .collect();

        if let Some(first) = channel.history.front() {
            if after + 1 < first.sequence {
                tracing::warn!(
                    conversation_id,
                    requested = after,
                    oldest = first.sequence,
                    "Replay requested beyond retained history"
                );
            }
        }

        channel.subscribers.push(Arc::clone(&queue));
        channel.last_activity = Utc::now();

        Subscription {
            conversation_id: conversation_id.to_string(),
            replay,
            queue,
        }
    }

    /// 取消订阅
    pub fn unsubscribe(&self, conversation_id: &str, subscriber_id: u64) {
        if let Some(channel) = self.channels.get(conversation_id).map(|e| Arc::clone(e.value())) {
            let mut channel = lock_channel(&channel);
            channel.subscribers.retain(|s| {
                if s.id == subscriber_id {
                    s.close();
                    false
                } else {
                    true
                }
            });
        }
    }

    /// 关闭会话流：结束所有订阅并丢弃历史
    pub fn close(&self, conversation_id: &str) {
        if let Some((_, channel)) = self.channels.remove(conversation_id) {
            let mut channel = lock_channel(&channel);
            for subscriber in channel.subscribers.drain(..) {
                subscriber.close();
            }
            channel.history.clear();
        }
    }

    /// 回收空闲会话流：没有存活订阅者且超过 max_age 没有活动的整体丢弃，返回回收数量
    pub fn evict_idle(&self, max_age: std::time::Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let before = self.channels.len();
        self.channels.retain(|conversation_id, channel| {
            let channel = lock_channel(channel);
            let idle = !channel.has_live_subscribers() && channel.last_activity < cutoff;
            if idle {
                tracing::debug!(conversation_id = %conversation_id, "Evicting idle event channel");
            }
            !idle
        });
        before.saturating_sub(self.channels.len())
    }

    /// 当前保留的会话流数量
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// 当前保留的历史（调试 / 轮询接口用）
    pub fn history(&self, conversation_id: &str) -> Vec<StreamEvent> {
        self.channels
            .get(conversation_id)
            .map(|e| Arc::clone(e.value()))
            .map(|c| lock_channel(&c).history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.channels
            .get(conversation_id)
            .map(|e| Arc::clone(e.value()))
            .map(|c| lock_channel(&c).subscribers.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100, 100)
    }
}

/// 一个订阅：回放部分 + 实时缓冲
pub struct Subscription {
    conversation_id: String,
    replay: VecDeque<StreamEvent>,
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.queue.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// 因缓冲满而丢弃的实时事件数
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// 下一条事件；流被关闭且缓冲取空后返回 None
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        loop {
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.queue.is_closed() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// 非阻塞地取下一条
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.replay.pop_front().or_else(|| self.queue.pop())
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // 发布方下次发布时会移除已关闭的订阅者
        self.queue.close();
    }
}
