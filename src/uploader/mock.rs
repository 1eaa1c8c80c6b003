// 测试用传输实现
//
// 按 (identifier, chunk_number) 预设探测结果和响应状态码，
// 记录所有探测与发送，并统计同时进行的发送数峰值。

use crate::uploader::transport::{
    ChunkMetadata, ChunkTransport, ProbeOutcome, ProgressReporter, TransportResponse,
};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type ChunkKey = (String, usize);

#[derive(Default)]
pub struct MockTransport {
    present: Mutex<HashSet<ChunkKey>>,
    scripts: Mutex<HashMap<ChunkKey, VecDeque<u16>>>,
    delays: Mutex<HashMap<String, Duration>>,
    default_delay: Mutex<Option<Duration>>,
    probes: Mutex<Vec<ChunkKey>>,
    sends: Mutex<Vec<ChunkMetadata>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 服务器已持有该分片
    pub fn mark_present(&self, identifier: &str, chunk_number: usize) {
        self.present
            .lock()
            .insert((identifier.to_string(), chunk_number));
    }

    /// 预设该分片依次返回的状态码，用完后返回 200；0 表示网络层失败
    pub fn script(&self, identifier: &str, chunk_number: usize, statuses: &[u16]) {
        self.scripts.lock().insert(
            (identifier.to_string(), chunk_number),
            statuses.iter().copied().collect(),
        );
    }

    /// 指定文件的每次发送耗时
    pub fn set_delay(&self, identifier: &str, delay: Duration) {
        self.delays.lock().insert(identifier.to_string(), delay);
    }

    pub fn set_default_delay(&self, delay: Duration) {
        *self.default_delay.lock() = Some(delay);
    }

    pub fn probes(&self) -> Vec<ChunkKey> {
        self.probes.lock().clone()
    }

    /// 已发出的 (identifier, chunk_number)，按发送顺序
    pub fn sends(&self) -> Vec<ChunkKey> {
        self.sends
            .lock()
            .iter()
            .map(|m| (m.identifier.clone(), m.chunk_number))
            .collect()
    }

    pub fn sent_metadata(&self) -> Vec<ChunkMetadata> {
        self.sends.lock().clone()
    }

    /// 同时进行的发送数峰值
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn delay_for(&self, identifier: &str) -> Option<Duration> {
        self.delays
            .lock()
            .get(identifier)
            .copied()
            .or(*self.default_delay.lock())
    }
}

/// 发送计数守卫，发送 future 被丢弃时同样会减计数
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(transport: &'a MockTransport) -> Self {
        let now = transport.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        transport.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(&transport.in_flight)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChunkTransport for MockTransport {
    async fn probe(&self, meta: &ChunkMetadata) -> Result<ProbeOutcome> {
        let key = (meta.identifier.clone(), meta.chunk_number);
        let present = self.present.lock().contains(&key);
        self.probes.lock().push(key);
        Ok(ProbeOutcome { present })
    }

    async fn send(
        &self,
        meta: &ChunkMetadata,
        data: Vec<u8>,
        reporter: ProgressReporter,
    ) -> Result<TransportResponse> {
        let _guard = InFlightGuard::enter(self);
        self.sends.lock().push(meta.clone());

        if let Some(delay) = self.delay_for(&meta.identifier) {
            tokio::time::sleep(delay).await;
        }
        reporter.report(data.len() as u64);

        let status = self
            .scripts
            .lock()
            .get_mut(&(meta.identifier.clone(), meta.chunk_number))
            .and_then(VecDeque::pop_front)
            .unwrap_or(200);

        if status == 0 {
            anyhow::bail!("connection reset");
        }

        Ok(TransportResponse::new(
            (200..300).contains(&status),
            status,
            format!("chunk {} -> {}", meta.chunk_number, status),
        ))
    }
}
