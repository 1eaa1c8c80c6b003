//! 会话级事件总线
//!
//! 每个上传会话拥有自己的监听器表，不存在进程级全局注册表。
//! 监听器在会话状态锁释放之后才被调用，因此可以在回调里安全地调用会话方法。

use super::{EventKind, UploadEvent};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// 事件监听回调
pub type Listener = Arc<dyn Fn(&UploadEvent) + Send + Sync>;

/// 事件总线
#[derive(Default)]
pub struct EventBus {
    /// 按事件类型注册的监听器
    listeners: DashMap<EventKind, Vec<Listener>>,
    /// 全量监听器（接收所有事件）
    catch_all: Mutex<Vec<Listener>>,
    /// channel 订阅者，接收端关闭后自动移除
    subscribers: Mutex<Vec<mpsc::UnboundedSender<UploadEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册指定类型事件的监听器
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.listeners
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    /// 注册接收所有事件的监听器
    pub fn on_any<F>(&self, listener: F)
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.catch_all.lock().push(Arc::new(listener));
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<UploadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// 发布单个事件
    pub fn emit(&self, event: &UploadEvent) {
        // 先复制出监听器列表再调用，避免回调中注册监听器时死锁
        let targeted: Vec<Listener> = self
            .listeners
            .get(&event.kind())
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        let catch_all: Vec<Listener> = self.catch_all.lock().clone();

        for listener in targeted.iter().chain(catch_all.iter()) {
            listener(event);
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// 按顺序发布一批事件
    pub fn emit_all(&self, events: Vec<UploadEvent>) {
        for event in &events {
            debug!("发布事件: {:?}", event.kind());
            self.emit(event);
        }
    }
}
