// 上传会话
//
// 会话持有全部文件，负责并发预算、选择下一个分片、分发生命周期事件。
//
// 并发模型：
// - 所有会话状态放在一把 parking_lot::Mutex 后面，状态变更全部在锁内完成
// - 探测、读取、发送在 tokio 任务中执行，不持有锁
// - 锁内产生的事件和待启动的任务先放进 Outbox，释放锁后再发布和启动
// - 每次分片完成（成功、失败、重新排队）都会重新填满并发预算，没有轮询循环

use crate::config::{FileOverrides, UploadConfig};
use crate::events::{EventBus, EventKind, ProgressThrottler, UploadEvent};
use crate::uploader::chunk::{
    chunk_count, chunk_range, Chunk, ChunkJob, ChunkVerdict, PreprocessState, SendOutcome,
};
use crate::uploader::error::UploadError;
use crate::uploader::file::{FileId, FileSnapshot, FileUpload};
use crate::uploader::scheduler::{self, Pick};
use crate::uploader::source::{default_identifier, FileSource, IdentifierHook, IdentifierResult};
use crate::uploader::transport::{
    ChunkMetadata, ChunkPreprocessor, ChunkTransport, ProgressReporter, RequestDecorator,
    RequestExtras,
};
use crate::uploader::validation::{self, CountDecision};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 会话钩子
#[derive(Clone, Default)]
pub struct SessionHooks {
    /// 自定义文件标识
    pub identifier: Option<IdentifierHook>,
    /// 分片发送前的预处理
    pub preprocessor: Option<Arc<dyn ChunkPreprocessor>>,
    /// 按分片生成附加查询参数与请求头
    pub request_decorator: Option<RequestDecorator>,
}

impl SessionHooks {
    pub fn with_identifier<F>(mut self, hook: F) -> Self
    where
        F: Fn(&dyn FileSource) -> IdentifierResult + Send + Sync + 'static,
    {
        self.identifier = Some(Arc::new(hook));
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn ChunkPreprocessor>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn with_request_decorator<F>(mut self, decorator: F) -> Self
    where
        F: Fn(&ChunkMetadata) -> RequestExtras + Send + Sync + 'static,
    {
        self.request_decorator = Some(Arc::new(decorator));
        self
    }
}

/// 添加单个文件的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added(FileId),
    /// 标识与已有文件相同，未加入
    SkippedDuplicate,
}

/// 批量添加的结果
#[derive(Debug, Default)]
pub struct AddReport {
    pub added: Vec<FileId>,
    /// 重复而被跳过的文件名
    pub skipped: Vec<String>,
    /// 未通过校验或无法计算标识的文件
    pub rejected: Vec<UploadError>,
}

// =====================================================
// 内部状态
// =====================================================

#[derive(Default)]
struct SessionState {
    files: Vec<FileUpload>,
    running: bool,
    complete_fired: bool,
    next_attempt: u64,
    next_file_id: u64,
}

impl SessionState {
    fn position(&self, id: FileId) -> Option<usize> {
        self.files.iter().position(|f| f.id == id)
    }

    fn total_size(&self) -> u64 {
        self.files.iter().map(FileUpload::size).sum()
    }

    /// 按文件大小加权的会话进度，总大小为 0 时返回 0
    fn progress(&mut self) -> f64 {
        let total = self.total_size();
        if total == 0 {
            return 0.0;
        }
        let weighted: f64 = self
            .files
            .iter_mut()
            .map(|f| {
                let size = f.size() as f64;
                f.progress() * size
            })
            .sum();
        (weighted / total as f64).min(1.0)
    }
}

struct PreprocessJob {
    file_id: FileId,
    chunk_index: usize,
    generation: u64,
    meta: ChunkMetadata,
    preprocessor: Arc<dyn ChunkPreprocessor>,
}

struct RetryTimer {
    file_id: FileId,
    chunk_index: usize,
    attempt: u64,
    delay: Duration,
}

struct ChunkingJob {
    file_id: FileId,
    generation: u64,
    total_size: u64,
    chunk_size: u64,
    /// 构建完成后若会话未在运行则自动开始（文件重试）
    start_on_complete: bool,
}

/// 锁内收集、锁外执行的副作用
#[derive(Default)]
struct Outbox {
    events: Vec<UploadEvent>,
    jobs: Vec<ChunkJob>,
    preprocess: Vec<PreprocessJob>,
    retries: Vec<RetryTimer>,
    chunking: Vec<ChunkingJob>,
}

struct SessionInner {
    id: String,
    config: Arc<UploadConfig>,
    transport: Arc<dyn ChunkTransport>,
    hooks: SessionHooks,
    state: Mutex<SessionState>,
    events: EventBus,
    throttler: ProgressThrottler,
}

/// 上传会话
///
/// 必须在 tokio 运行时中使用：添加文件、开始上传等操作会启动后台任务。
#[derive(Clone)]
pub struct UploadSession {
    inner: Arc<SessionInner>,
}

impl UploadSession {
    /// 创建上传会话
    pub fn new(config: UploadConfig, transport: Arc<dyn ChunkTransport>) -> Result<Self, UploadError> {
        Self::with_hooks(config, transport, SessionHooks::default())
    }

    /// 创建带钩子的上传会话
    pub fn with_hooks(
        config: UploadConfig,
        transport: Arc<dyn ChunkTransport>,
        hooks: SessionHooks,
    ) -> Result<Self, UploadError> {
        config.validate().map_err(UploadError::InvalidConfig)?;

        let id = uuid::Uuid::new_v4().to_string();
        info!(
            "创建上传会话: id={}, 分片大小={} bytes, 最大并发={}, 断点探测={}",
            id, config.chunk_size, config.simultaneous_uploads, config.test_chunks
        );

        let throttler = ProgressThrottler::with_millis(config.progress_interval_ms);
        let state = SessionState {
            next_attempt: 1,
            next_file_id: 1,
            ..Default::default()
        };

        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                config: Arc::new(config),
                transport,
                hooks,
                state: Mutex::new(state),
                events: EventBus::new(),
                throttler,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    // =====================================================
    // 事件
    // =====================================================

    /// 注册指定类型事件的监听器
    ///
    /// 监听器在会话锁释放后调用，可以在回调中调用会话方法
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener);
    }

    /// 注册接收所有事件的监听器
    pub fn on_any<F>(&self, listener: F)
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_any(listener);
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    // =====================================================
    // 添加文件
    // =====================================================

    /// 添加单个文件
    pub async fn add_source(&self, source: Arc<dyn FileSource>) -> Result<AddOutcome, UploadError> {
        self.add_source_with_options(source, FileOverrides::default())
            .await
    }

    /// 添加单个文件并覆盖部分配置
    pub async fn add_source_with_options(
        &self,
        source: Arc<dyn FileSource>,
        overrides: FileOverrides,
    ) -> Result<AddOutcome, UploadError> {
        let mut report = self
            .add_sources_with_options(vec![(source, overrides)])
            .await?;

        if let Some(err) = report.rejected.pop() {
            return Err(err);
        }

        Ok(match report.added.first() {
            Some(id) => AddOutcome::Added(*id),
            None => AddOutcome::SkippedDuplicate,
        })
    }

    /// 批量添加文件
    pub async fn add_sources(&self, sources: Vec<Arc<dyn FileSource>>) -> Result<AddReport, UploadError> {
        let entries = sources
            .into_iter()
            .map(|source| (source, FileOverrides::default()))
            .collect();
        self.add_sources_with_options(entries).await
    }

    /// 批量添加文件（每个文件可带覆盖配置）
    ///
    /// 文件数量超限时整批拒绝；单个文件的校验失败只影响该文件
    pub async fn add_sources_with_options(
        &self,
        entries: Vec<(Arc<dyn FileSource>, FileOverrides)>,
    ) -> Result<AddReport, UploadError> {
        let inner = &self.inner;
        let config = &inner.config;

        // 计算标识前先按当前文件数快速拒绝，插入前在锁内再校验一次
        let existing = inner.state.lock().files.len();
        validation::check_file_count(config.max_files, existing, entries.len()).map_err(
            |violation| {
                warn!("会话 {} 拒绝添加文件: {}", inner.id, violation);
                violation
            },
        )?;

        let mut report = AddReport::default();
        let mut candidates = Vec::with_capacity(entries.len());

        for (source, overrides) in entries {
            if let Err(violation) = validation::check_source(config, source.as_ref()) {
                warn!("文件未通过校验: {}", violation);
                report.rejected.push(violation.into());
                continue;
            }

            match inner.identifier_for(source.as_ref()).await {
                Ok(identifier) => candidates.push((source, overrides, identifier)),
                Err(e) => {
                    warn!("文件 {} 计算标识失败: {}", source.name(), e);
                    report.rejected.push(e);
                }
            }
        }

        let mut out = Outbox::default();
        {
            let mut state = inner.state.lock();

            let decision =
                validation::check_file_count(config.max_files, state.files.len(), candidates.len())
                    .map_err(|violation| {
                        warn!("会话 {} 拒绝添加文件: {}", inner.id, violation);
                        violation
                    })?;

            if decision == CountDecision::ReplaceExisting && !candidates.is_empty() {
                for mut file in state.files.drain(..) {
                    file.abort_in_flight();
                    info!("单文件会话，替换已有文件: {}", file.name());
                }
            }

            for (source, overrides, identifier) in candidates {
                if state.files.iter().any(|f| f.identifier == identifier) {
                    debug!("跳过重复文件: {} (identifier={})", source.name(), identifier);
                    report.skipped.push(source.name().to_string());
                    continue;
                }

                let id = FileId(state.next_file_id);
                state.next_file_id += 1;

                let options = Arc::new(config.resolve(&overrides));
                let file = FileUpload::new(id, source, identifier, options);

                info!(
                    "会话 {} 添加文件: id={}, name={}, size={} bytes, 分片大小={} bytes",
                    inner.id,
                    id,
                    file.name(),
                    file.size(),
                    file.options.chunk_size
                );

                out.events.push(UploadEvent::FileAdded {
                    file_id: id,
                    identifier: file.identifier.clone(),
                    file_name: file.name().to_string(),
                    total_size: file.size(),
                });
                out.chunking.push(ChunkingJob {
                    file_id: id,
                    generation: file.generation(),
                    total_size: file.size(),
                    chunk_size: file.options.chunk_size,
                    start_on_complete: false,
                });

                report.added.push(id);
                state.files.push(file);
            }

            if !report.added.is_empty() || !report.skipped.is_empty() {
                out.events.push(UploadEvent::FilesAdded {
                    added: report.added.clone(),
                    skipped: report.skipped.clone(),
                });
            }
        }
        inner.flush(out);

        Ok(report)
    }

    // =====================================================
    // 会话控制
    // =====================================================

    /// 开始上传，已在上传中时不做任何事
    pub fn start(&self) {
        let inner = &self.inner;
        let mut out = Outbox::default();
        {
            let mut state = inner.state.lock();
            if state.running {
                debug!("会话 {} 已在上传中", inner.id);
                return;
            }
            inner.begin_run(&mut state, &mut out);
            inner.pump_locked(&mut state, &mut out);
        }
        inner.flush(out);
    }

    /// 暂停所有文件：中止进行中的请求，保留排队状态
    pub fn pause_all(&self) {
        let inner = &self.inner;
        let mut out = Outbox::default();
        {
            let mut state = inner.state.lock();
            state.running = false;
            let aborted: usize = state.files.iter_mut().map(FileUpload::abort_in_flight).sum();
            info!("会话 {} 已暂停，中止 {} 个进行中的分片", inner.id, aborted);
            out.events.push(UploadEvent::Pause);
        }
        inner.flush(out);
    }

    /// 取消所有文件并清空会话
    pub fn cancel_all(&self) {
        let inner = &self.inner;
        inner.events.emit(&UploadEvent::BeforeCancel);
        {
            let mut state = inner.state.lock();
            for file in state.files.iter_mut() {
                file.abort_in_flight();
            }
            let removed = state.files.len();
            state.files.clear();
            state.running = false;
            state.complete_fired = false;
            info!("会话 {} 已取消，移除 {} 个文件", inner.id, removed);
        }
        inner.events.emit(&UploadEvent::Cancel);
    }

    /// 调度一次：发出下一个分片
    ///
    /// 会话未在运行、已达并发上限或没有可调度分片时返回 false；
    /// 没有任何未完成工作时触发一次 Complete
    pub fn upload_next_chunk(&self) -> bool {
        let inner = &self.inner;
        let mut out = Outbox::default();
        let dispatched = {
            let mut state = inner.state.lock();
            inner.dispatch_locked(&mut state, &mut out)
        };
        inner.flush(out);
        dispatched
    }

    // =====================================================
    // 文件控制
    // =====================================================

    /// 暂停或恢复单个文件（暂停不会中止进行中的分片）
    pub fn pause_file(&self, id: FileId, paused: bool) -> Result<(), UploadError> {
        let inner = &self.inner;
        let mut out = Outbox::default();
        {
            let mut state = inner.state.lock();
            let pos = state.position(id).ok_or(UploadError::FileNotFound(id))?;
            state.files[pos].set_paused(paused);
            info!(
                "文件 {} {}",
                id,
                if paused { "已暂停" } else { "已恢复" }
            );
            if !paused && state.running {
                inner.pump_locked(&mut state, &mut out);
            }
        }
        inner.flush(out);
        Ok(())
    }

    /// 重试文件：清除错误，重建分片列表，构建完成后重新进入队列
    pub fn retry_file(&self, id: FileId) -> Result<(), UploadError> {
        let inner = &self.inner;
        let mut out = Outbox::default();
        {
            let mut state = inner.state.lock();
            let pos = state.position(id).ok_or(UploadError::FileNotFound(id))?;
            let file = &mut state.files[pos];
            let generation = file.begin_rebuild();
            info!("重试文件: id={}, name={}", id, file.name());
            out.chunking.push(ChunkingJob {
                file_id: id,
                generation,
                total_size: file.size(),
                chunk_size: file.options.chunk_size,
                start_on_complete: true,
            });
        }
        inner.flush(out);
        Ok(())
    }

    /// 取消文件：中止其分片，从会话移除，并重新调度空出的并发槽位
    pub fn cancel_file(&self, id: FileId) -> Result<(), UploadError> {
        let inner = &self.inner;
        let mut out = Outbox::default();
        {
            let mut state = inner.state.lock();
            let pos = state.position(id).ok_or(UploadError::FileNotFound(id))?;
            let mut file = state.files.remove(pos);
            let aborted = file.abort_in_flight();
            info!(
                "取消文件: id={}, name={}, 中止 {} 个分片",
                id,
                file.name(),
                aborted
            );
            if state.running {
                inner.pump_locked(&mut state, &mut out);
            }
        }
        inner.flush(out);
        Ok(())
    }

    /// 移除文件（同 cancel_file）
    pub fn remove_file(&self, id: FileId) -> Result<(), UploadError> {
        self.cancel_file(id)
    }

    // =====================================================
    // 查询
    // =====================================================

    /// 是否有分片正在探测或发送
    pub fn is_uploading(&self) -> bool {
        self.inner
            .state
            .lock()
            .files
            .iter()
            .any(FileUpload::is_uploading)
    }

    /// 会话进度 [0, 1]
    pub fn progress(&self) -> f64 {
        self.inner.state.lock().progress()
    }

    /// 所有文件总大小
    pub fn total_size(&self) -> u64 {
        self.inner.state.lock().total_size()
    }

    /// 正在探测或发送的分片数
    pub fn in_flight_count(&self) -> usize {
        scheduler::in_flight_count(&self.inner.state.lock().files)
    }

    /// 文件进度
    pub fn file_progress(&self, id: FileId) -> Option<f64> {
        let mut state = self.inner.state.lock();
        let pos = state.position(id)?;
        Some(state.files[pos].progress())
    }

    /// 所有文件的快照
    pub fn files(&self) -> Vec<FileSnapshot> {
        self.inner
            .state
            .lock()
            .files
            .iter()
            .map(FileUpload::snapshot)
            .collect()
    }

    pub fn file(&self, id: FileId) -> Option<FileSnapshot> {
        let state = self.inner.state.lock();
        state
            .files
            .iter()
            .find(|f| f.id == id)
            .map(FileUpload::snapshot)
    }

    pub fn file_by_identifier(&self, identifier: &str) -> Option<FileSnapshot> {
        let state = self.inner.state.lock();
        state
            .files
            .iter()
            .find(|f| f.identifier == identifier)
            .map(FileUpload::snapshot)
    }
}

impl SessionInner {
    async fn identifier_for(&self, source: &dyn FileSource) -> Result<String, UploadError> {
        match &self.hooks.identifier {
            Some(hook) => hook(source)
                .resolve()
                .await
                .map_err(|e| UploadError::Identifier(format!("{:#}", e))),
            None => Ok(default_identifier(source.size(), source.relative_path())),
        }
    }

    /// 发布事件并启动锁内登记的任务
    fn flush(self: &Arc<Self>, out: Outbox) {
        self.events.emit_all(out.events);

        for job in out.chunking {
            let inner = self.clone();
            tokio::spawn(async move { inner.build_chunks(job).await });
        }
        for job in out.preprocess {
            let inner = self.clone();
            tokio::spawn(async move { inner.run_preprocess(job).await });
        }
        for job in out.jobs {
            let inner = self.clone();
            tokio::spawn(async move { inner.run_chunk(job).await });
        }
        for timer in out.retries {
            let inner = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timer.delay).await;
                inner.release_retry(timer);
            });
        }
    }

    fn begin_run(&self, state: &mut SessionState, out: &mut Outbox) {
        state.running = true;
        state.complete_fired = false;
        self.throttler.reset();
        info!("会话 {} 开始上传: {} 个文件", self.id, state.files.len());
        out.events.push(UploadEvent::UploadStart);
    }

    /// 连续调度，直到填满并发预算或没有可调度分片
    fn pump_locked(self: &Arc<Self>, state: &mut SessionState, out: &mut Outbox) {
        for _ in 0..self.config.simultaneous_uploads {
            if !self.dispatch_locked(state, out) {
                break;
            }
        }
    }

    fn dispatch_locked(self: &Arc<Self>, state: &mut SessionState, out: &mut Outbox) -> bool {
        if !state.running {
            return false;
        }
        if scheduler::in_flight_count(&state.files) >= self.config.simultaneous_uploads {
            return false;
        }

        match scheduler::pick_next(&state.files, self.config.prioritize_first_and_last_chunk) {
            Some(pick) => self.launch(state, pick, out),
            None => {
                if !state.complete_fired && !scheduler::has_outstanding(&state.files) {
                    state.complete_fired = true;
                    state.running = false;
                    info!("会话 {} 所有文件处理完毕", self.id);
                    out.events.push(UploadEvent::Complete);
                }
                false
            }
        }
    }

    fn launch(self: &Arc<Self>, state: &mut SessionState, pick: Pick, out: &mut Outbox) -> bool {
        let attempt = state.next_attempt;
        state.next_attempt += 1;

        let file = &mut state.files[pick.file_pos];
        let Some(meta) = file.metadata_for(pick.chunk_index) else {
            return false;
        };
        let file_id = file.id;
        let generation = file.generation();
        let test_chunks = file.options.test_chunks;
        let source = file.source.clone();
        let Some(chunk) = file.chunk_mut(pick.chunk_index) else {
            return false;
        };

        if let Some(preprocessor) = &self.hooks.preprocessor {
            if chunk.preprocess() == PreprocessState::None {
                chunk.begin_preprocess();
                debug!("分片预处理: file={}, chunk={}", file_id, pick.chunk_index);
                out.preprocess.push(PreprocessJob {
                    file_id,
                    chunk_index: pick.chunk_index,
                    generation,
                    meta,
                    preprocessor: preprocessor.clone(),
                });
                return true;
            }
        }

        let needs_probe = test_chunks && !chunk.tested();
        let token = chunk.begin(attempt, needs_probe);
        let reporter = ProgressReporter::new(
            chunk.counter(),
            Some(self.progress_notifier(file_id, pick.chunk_index)),
        );

        debug!(
            "会话 {} 发出分片: file={}, chunk={}/{}, attempt={}, 探测={}",
            self.id,
            file_id,
            meta.chunk_number,
            meta.total_chunks,
            attempt,
            needs_probe
        );

        out.jobs.push(ChunkJob {
            file_id,
            index: pick.chunk_index,
            attempt,
            meta,
            needs_probe,
            source,
            transport: self.transport.clone(),
            token,
            reporter,
        });
        true
    }

    fn progress_notifier(self: &Arc<Self>, file_id: FileId, chunk_index: usize) -> Arc<dyn Fn() + Send + Sync> {
        let weak: Weak<SessionInner> = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_bytes_sent(file_id, chunk_index);
            }
        })
    }

    /// 传输层字节进度回调（节流）
    fn on_bytes_sent(&self, file_id: FileId, chunk_index: usize) {
        if !self.throttler.should_emit() {
            return;
        }

        let events = {
            let mut state = self.state.lock();
            let Some(pos) = state.position(file_id) else {
                return;
            };
            let file = &mut state.files[pos];
            let Some(chunk_progress) = file.chunks().get(chunk_index).map(Chunk::progress) else {
                return;
            };
            let file_progress = file.progress();
            let session_progress = state.progress();
            vec![
                UploadEvent::ChunkProgress {
                    file_id,
                    chunk_index,
                    progress: chunk_progress,
                },
                UploadEvent::FileProgress {
                    file_id,
                    progress: file_progress,
                },
                UploadEvent::Progress {
                    progress: session_progress,
                },
            ]
        };
        self.events.emit_all(events);
    }

    // =====================================================
    // 分片任务
    // =====================================================

    async fn run_chunk(self: Arc<Self>, mut job: ChunkJob) {
        if let Some(decorator) = &self.hooks.request_decorator {
            let extras = decorator(&job.meta);
            job.meta.apply_extras(extras);
        }

        if job.needs_probe {
            match job.probe().await {
                None => return,
                Some(true) => {
                    self.finish_probe_present(&job);
                    return;
                }
                Some(false) => {
                    if !self.begin_transfer(&job) {
                        return;
                    }
                }
            }
        }

        if let Some(outcome) = job.transfer().await {
            self.finish_transfer(&job, outcome);
        }
    }

    fn begin_transfer(&self, job: &ChunkJob) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = accepted_position(&state, job) else {
            return false;
        };
        match state.files[pos].chunk_mut(job.index) {
            Some(chunk) => {
                chunk.probe_absent();
                true
            }
            None => false,
        }
    }

    fn finish_probe_present(self: &Arc<Self>, job: &ChunkJob) {
        let mut out = Outbox::default();
        {
            let mut state = self.state.lock();
            let Some(pos) = accepted_position(&state, job) else {
                return;
            };
            if let Some(chunk) = state.files[pos].chunk_mut(job.index) {
                chunk.mark_success();
            }
            debug!(
                "服务器已有分片，跳过发送: file={}, chunk={}",
                job.file_id, job.meta.chunk_number
            );
            self.apply_verdict(
                &mut state,
                pos,
                job,
                ChunkVerdict::Success {
                    body: String::new(),
                },
                &mut out,
            );
            self.pump_locked(&mut state, &mut out);
        }
        self.flush(out);
    }

    fn finish_transfer(self: &Arc<Self>, job: &ChunkJob, outcome: SendOutcome) {
        let mut out = Outbox::default();
        {
            let mut state = self.state.lock();
            let Some(pos) = accepted_position(&state, job) else {
                return;
            };
            let Some(chunk) = state.files[pos].chunk_mut(job.index) else {
                return;
            };
            let verdict = chunk.resolve(outcome, &self.config);
            self.apply_verdict(&mut state, pos, job, verdict, &mut out);
            self.pump_locked(&mut state, &mut out);
        }
        self.flush(out);
    }

    fn apply_verdict(
        &self,
        state: &mut SessionState,
        pos: usize,
        job: &ChunkJob,
        verdict: ChunkVerdict,
        out: &mut Outbox,
    ) {
        let file_id = job.file_id;
        let chunk_index = job.index;

        match verdict {
            ChunkVerdict::Success { body } => {
                let file = &mut state.files[pos];
                let file_progress = file.progress();
                let finished = file.error().is_none() && file.is_complete();
                if finished {
                    info!(
                        "文件上传完成: id={}, name={}, 分片数={}",
                        file_id,
                        file.name(),
                        file.chunks().len()
                    );
                }

                out.events.push(UploadEvent::ChunkProgress {
                    file_id,
                    chunk_index,
                    progress: 1.0,
                });
                out.events.push(UploadEvent::FileProgress {
                    file_id,
                    progress: file_progress,
                });
                let session_progress = state.progress();
                out.events.push(UploadEvent::Progress {
                    progress: session_progress,
                });
                if finished {
                    out.events.push(UploadEvent::FileSuccess {
                        file_id,
                        message: body,
                    });
                }
            }
            ChunkVerdict::Retry { retry_count, delay } => {
                warn!(
                    "分片上传失败，重新排队: file={}, chunk={}, 第 {} 次重试, 延迟={:?}",
                    file_id, job.meta.chunk_number, retry_count, delay
                );
                out.events.push(UploadEvent::FileRetry {
                    file_id,
                    chunk_index,
                    retry_count,
                });
                if let Some(delay) = delay {
                    out.retries.push(RetryTimer {
                        file_id,
                        chunk_index,
                        attempt: job.attempt,
                        delay,
                    });
                }
            }
            ChunkVerdict::Failed { status, message } => {
                let file = &mut state.files[pos];
                let aborted = file.fail(message.clone());
                error!(
                    "分片上传失败，文件终止: file={}, chunk={}, status={}, 中止其余 {} 个分片, 错误: {}",
                    file_id, job.meta.chunk_number, status, aborted, message
                );
                let file_progress = file.progress();

                out.events.push(UploadEvent::FileError { file_id, message });
                out.events.push(UploadEvent::FileProgress {
                    file_id,
                    progress: file_progress,
                });
                let session_progress = state.progress();
                out.events.push(UploadEvent::Progress {
                    progress: session_progress,
                });
            }
        }
    }

    fn release_retry(self: &Arc<Self>, timer: RetryTimer) {
        let mut out = Outbox::default();
        {
            let mut state = self.state.lock();
            let Some(pos) = state.position(timer.file_id) else {
                return;
            };
            let Some(chunk) = state.files[pos].chunk_mut(timer.chunk_index) else {
                return;
            };
            if !chunk.release_retry(timer.attempt) {
                return;
            }
            self.pump_locked(&mut state, &mut out);
        }
        self.flush(out);
    }

    async fn run_preprocess(self: Arc<Self>, job: PreprocessJob) {
        let result = job.preprocessor.preprocess(&job.meta).await;

        let mut out = Outbox::default();
        {
            let mut state = self.state.lock();
            let Some(pos) = state.position(job.file_id) else {
                return;
            };
            let file = &mut state.files[pos];
            if file.generation() != job.generation {
                return;
            }
            let Some(chunk) = file.chunk_mut(job.chunk_index) else {
                return;
            };
            if chunk.preprocess() != PreprocessState::Running {
                return;
            }

            match result {
                Ok(()) => {
                    chunk.finish_preprocess();
                    debug!(
                        "分片预处理完成: file={}, chunk={}",
                        job.file_id, job.meta.chunk_number
                    );
                    self.pump_locked(&mut state, &mut out);
                }
                Err(e) => {
                    warn!(
                        "分片预处理失败，需重试文件: file={}, chunk={}, 错误: {:#}",
                        job.file_id, job.meta.chunk_number, e
                    );
                    out.events.push(UploadEvent::PreprocessStalled {
                        file_id: job.file_id,
                        chunk_index: job.chunk_index,
                        error: format!("{:#}", e),
                    });
                }
            }
        }
        self.flush(out);
    }

    // =====================================================
    // 分片构建
    // =====================================================

    async fn build_chunks(self: Arc<Self>, job: ChunkingJob) {
        let ChunkingJob {
            file_id,
            generation,
            total_size,
            chunk_size,
            start_on_complete,
        } = job;

        self.events.emit(&UploadEvent::ChunkingStart { file_id });

        let count = chunk_count(total_size, chunk_size);
        let batch = self.config.chunking_batch_size.max(1);
        let mut chunks = Vec::with_capacity(count);

        for index in 0..count {
            chunks.push(Chunk::new(
                file_id,
                index,
                chunk_range(index, total_size, chunk_size),
            ));

            let built = index + 1;
            if built % batch == 0 && built < count {
                self.events.emit(&UploadEvent::ChunkingProgress {
                    file_id,
                    progress: built as f64 / count as f64,
                });
                tokio::task::yield_now().await;
            }
        }

        let mut out = Outbox::default();
        {
            let mut state = self.state.lock();
            let Some(pos) = state.position(file_id) else {
                debug!("文件已移除，丢弃分片构建结果: {}", file_id);
                return;
            };
            if !state.files[pos].install_chunks(generation, chunks) {
                debug!("分片列表已重建，丢弃过期结果: {}", file_id);
                return;
            }
            debug!("文件分片构建完成: id={}, 分片数={}", file_id, count);
            out.events.push(UploadEvent::ChunkingComplete {
                file_id,
                total_chunks: count,
            });

            if start_on_complete && !state.running {
                self.begin_run(&mut state, &mut out);
            }
            if state.running {
                self.pump_locked(&mut state, &mut out);
            }
        }
        self.flush(out);
    }
}

/// 完成回调仍然有效时返回文件位置
fn accepted_position(state: &SessionState, job: &ChunkJob) -> Option<usize> {
    let pos = state.position(job.file_id)?;
    let chunk = state.files[pos].chunks().get(job.index)?;
    if chunk.accepts(job.attempt) {
        Some(pos)
    } else {
        debug!(
            "忽略过期的分片结果: file={}, chunk={}, attempt={}",
            job.file_id, job.index, job.attempt
        );
        None
    }
}
