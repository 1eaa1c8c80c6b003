// 上传分片
//
// 每个分片持有文件的一段字节范围，自己维护传输状态和重试次数。
// 分片本身不做 I/O：发起请求时生成 ChunkJob，由会话在锁外执行，
// 结果再交回分片的状态机处理。
//
// 状态流转：
// - pending  -> testing    开启断点续传探测时先探测
// - pending  -> uploading  直接发送数据
// - testing  -> success    服务器已有该分片
// - testing  -> uploading  服务器没有该分片（探测失败同样视为没有）
// - uploading -> success   发送成功
// - uploading -> error     永久错误或重试次数耗尽
// - uploading -> pending   可重试错误，retry_count + 1
// - testing/uploading -> pending  abort（不增加重试次数）

use crate::config::UploadConfig;
use crate::uploader::source::FileSource;
use crate::uploader::transport::{ChunkMetadata, ChunkTransport, ProgressReporter, TransportResponse};
use crate::uploader::FileId;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 已发出但尚无字节反馈的分片显示的进度
pub const OPTIMISTIC_PROGRESS: f64 = 0.01;

/// 计算分片数量（空文件也有一个空分片）
pub fn chunk_count(total_size: u64, chunk_size: u64) -> usize {
    if total_size == 0 {
        return 1;
    }
    total_size.div_ceil(chunk_size.max(1)) as usize
}

/// 第 `index` 个分片的字节范围，最后一个分片承接余数
pub fn chunk_range(index: usize, total_size: u64, chunk_size: u64) -> Range<u64> {
    let chunk_size = chunk_size.max(1);
    let start = (index as u64).saturating_mul(chunk_size).min(total_size);
    let end = start.saturating_add(chunk_size).min(total_size);
    start..end
}

/// 把文件切分为连续的字节范围
pub fn partition(total_size: u64, chunk_size: u64) -> Vec<Range<u64>> {
    (0..chunk_count(total_size, chunk_size))
        .map(|index| chunk_range(index, total_size, chunk_size))
        .collect()
}

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Pending,
    Testing,
    Uploading,
    Success,
    Error,
}

/// 预处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreprocessState {
    None,
    Running,
    Done,
}

/// 传输层回报的已发送字节数
#[derive(Debug, Default)]
pub struct ByteCounter {
    loaded: AtomicU64,
    reported: AtomicBool,
}

impl ByteCounter {
    pub fn record(&self, loaded: u64) {
        self.loaded.store(loaded, Ordering::SeqCst);
        self.reported.store(true, Ordering::SeqCst);
    }

    /// 尚无反馈时返回 None
    pub fn loaded(&self) -> Option<u64> {
        self.reported
            .load(Ordering::SeqCst)
            .then(|| self.loaded.load(Ordering::SeqCst))
    }

    pub fn clear(&self) {
        self.reported.store(false, Ordering::SeqCst);
        self.loaded.store(0, Ordering::SeqCst);
    }
}

/// 上传请求结果（网络层失败为 Err）
pub type SendOutcome = anyhow::Result<TransportResponse>;

/// 上传结果处理结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkVerdict {
    /// 分片完成，body 为响应内容
    Success { body: String },
    /// 重新排队，delay 为 None 时立即可调度
    Retry {
        retry_count: u32,
        delay: Option<Duration>,
    },
    /// 分片失败（终态）
    Failed { status: u16, message: String },
}

/// 上传分片
#[derive(Debug)]
pub struct Chunk {
    pub file_id: FileId,
    pub index: usize,
    pub range: Range<u64>,
    state: ChunkState,
    retry_count: u32,
    preprocess: PreprocessState,
    /// 已经探测过（服务器没有），重试时不再探测
    tested: bool,
    /// 等待退避计时结束
    waiting_retry: bool,
    /// 当前请求编号，用于丢弃过期的完成回调
    attempt: u64,
    cancel: Option<CancellationToken>,
    counter: Arc<ByteCounter>,
}

impl Chunk {
    pub fn new(file_id: FileId, index: usize, range: Range<u64>) -> Self {
        Self {
            file_id,
            index,
            range,
            state: ChunkState::Pending,
            retry_count: 0,
            preprocess: PreprocessState::None,
            tested: false,
            waiting_retry: false,
            attempt: 0,
            cancel: None,
            counter: Arc::new(ByteCounter::default()),
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn preprocess(&self) -> PreprocessState {
        self.preprocess
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn tested(&self) -> bool {
        self.tested
    }

    pub fn counter(&self) -> Arc<ByteCounter> {
        self.counter.clone()
    }

    /// 正在探测或发送
    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, ChunkState::Testing | ChunkState::Uploading)
    }

    /// 可以被调度器选中
    pub fn is_dispatchable(&self) -> bool {
        self.state == ChunkState::Pending
            && !self.waiting_retry
            && self.preprocess != PreprocessState::Running
    }

    /// 还有未完成的工作
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self.state,
            ChunkState::Pending | ChunkState::Testing | ChunkState::Uploading
        ) || self.preprocess == PreprocessState::Running
    }

    /// 分片进度 [0, 1]
    pub fn progress(&self) -> f64 {
        match self.state {
            ChunkState::Success | ChunkState::Error => 1.0,
            ChunkState::Pending => 0.0,
            ChunkState::Testing | ChunkState::Uploading => match self.counter.loaded() {
                Some(loaded) if self.size() > 0 => {
                    (loaded as f64 / self.size() as f64).clamp(OPTIMISTIC_PROGRESS, 1.0)
                }
                _ => OPTIMISTIC_PROGRESS,
            },
        }
    }

    pub fn begin_preprocess(&mut self) {
        self.preprocess = PreprocessState::Running;
    }

    pub fn finish_preprocess(&mut self) {
        self.preprocess = PreprocessState::Done;
    }

    /// 发出请求：进入 testing 或 uploading，返回本次请求的取消令牌
    pub fn begin(&mut self, attempt: u64, probe: bool) -> CancellationToken {
        let token = CancellationToken::new();
        self.state = if probe {
            ChunkState::Testing
        } else {
            ChunkState::Uploading
        };
        self.attempt = attempt;
        self.waiting_retry = false;
        self.cancel = Some(token.clone());
        self.counter.clear();
        token
    }

    /// 本次完成回调是否仍然有效
    pub fn accepts(&self, attempt: u64) -> bool {
        self.attempt == attempt && self.is_in_flight()
    }

    /// 探测结果：服务器没有该分片，继续发送数据
    pub fn probe_absent(&mut self) {
        if self.state == ChunkState::Testing {
            self.state = ChunkState::Uploading;
            self.tested = true;
        }
    }

    /// 探测结果：服务器已有该分片
    pub fn mark_success(&mut self) {
        self.state = ChunkState::Success;
        self.cancel = None;
    }

    /// 取消进行中的请求，回到 pending，不增加重试次数
    ///
    /// 只对 testing/uploading 状态有效
    pub fn abort(&mut self) -> bool {
        if !self.is_in_flight() {
            return false;
        }
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.state = ChunkState::Pending;
        self.counter.clear();
        debug!(
            "分片已中止: file={}, chunk={}, attempt={}",
            self.file_id, self.index, self.attempt
        );
        true
    }

    /// 处理上传结果
    pub fn resolve(&mut self, outcome: SendOutcome, config: &UploadConfig) -> ChunkVerdict {
        self.cancel = None;

        let (status, body) = match outcome {
            Ok(response) if response.ok => {
                self.state = ChunkState::Success;
                return ChunkVerdict::Success {
                    body: response.body,
                };
            }
            Ok(response) => (response.status, response.body),
            Err(e) => (0, format!("{:#}", e)),
        };

        self.counter.clear();

        if config.is_permanent_error(status) || self.retry_count >= config.max_chunk_retries {
            self.state = ChunkState::Error;
            let message = if body.is_empty() {
                format!("分片上传失败: status={}", status)
            } else {
                body
            };
            return ChunkVerdict::Failed { status, message };
        }

        self.retry_count += 1;
        self.state = ChunkState::Pending;
        let delay = config.retry_backoff.delay(self.retry_count - 1);
        self.waiting_retry = delay.is_some();

        ChunkVerdict::Retry {
            retry_count: self.retry_count,
            delay,
        }
    }

    /// 退避计时结束，允许重新调度
    pub fn release_retry(&mut self, attempt: u64) -> bool {
        if self.attempt == attempt && self.waiting_retry {
            self.waiting_retry = false;
            return true;
        }
        false
    }
}

// =====================================================
// 分片请求
// =====================================================

/// 一次分片请求所需的全部数据，在会话锁外执行
pub struct ChunkJob {
    pub file_id: FileId,
    pub index: usize,
    pub attempt: u64,
    pub meta: ChunkMetadata,
    pub needs_probe: bool,
    pub source: Arc<dyn FileSource>,
    pub transport: Arc<dyn ChunkTransport>,
    pub token: CancellationToken,
    pub reporter: ProgressReporter,
}

impl ChunkJob {
    /// 探测服务器是否已有分片，被取消时返回 None
    pub async fn probe(&self) -> Option<bool> {
        tokio::select! {
            _ = self.token.cancelled() => None,
            result = self.transport.probe(&self.meta) => match result {
                Ok(outcome) => Some(outcome.present),
                Err(e) => {
                    debug!(
                        "探测分片失败，按未上传处理: file={}, chunk={}, 错误: {:#}",
                        self.file_id, self.index, e
                    );
                    Some(false)
                }
            },
        }
    }

    /// 读取并发送分片数据，被取消时返回 None
    pub async fn transfer(&self) -> Option<SendOutcome> {
        let work = async {
            let data = self
                .source
                .read_range(self.meta.byte_range.clone())
                .await
                .context("读取分片数据失败")?;
            self.transport
                .send(&self.meta, data, self.reporter.clone())
                .await
        };

        tokio::select! {
            _ = self.token.cancelled() => None,
            outcome = work => Some(outcome),
        }
    }
}
