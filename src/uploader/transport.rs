// 分片传输接口
//
// 引擎通过 ChunkTransport 发出探测请求和上传请求，不关心具体的 HTTP 实现。
// 默认实现见 http.rs，测试中使用 mock 实现。

use crate::config::ParameterNames;
use crate::uploader::chunk::ByteCounter;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

/// 单个分片请求携带的元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMetadata {
    /// 分片序号（从 1 开始）
    pub chunk_number: usize,
    /// 配置的分片大小
    pub chunk_size: u64,
    /// 本分片实际字节数
    pub current_chunk_size: u64,
    pub total_size: u64,
    pub mime_type: String,
    pub identifier: String,
    pub file_name: String,
    pub relative_path: String,
    pub total_chunks: usize,
    /// 分片在文件中的字节范围
    pub byte_range: Range<u64>,
    /// 查询参数（静态 + 文件级 + 动态）
    pub query: Vec<(String, String)>,
    /// 请求头（静态 + 文件级 + 动态）
    pub headers: Vec<(String, String)>,
}

impl ChunkMetadata {
    /// 按配置的字段名生成元数据参数列表
    pub fn parameters(&self, names: &ParameterNames) -> Vec<(String, String)> {
        vec![
            (
                names.qualified(&names.chunk_number),
                self.chunk_number.to_string(),
            ),
            (
                names.qualified(&names.chunk_size),
                self.chunk_size.to_string(),
            ),
            (
                names.qualified(&names.current_chunk_size),
                self.current_chunk_size.to_string(),
            ),
            (
                names.qualified(&names.total_size),
                self.total_size.to_string(),
            ),
            (names.qualified(&names.mime_type), self.mime_type.clone()),
            (names.qualified(&names.identifier), self.identifier.clone()),
            (names.qualified(&names.file_name), self.file_name.clone()),
            (
                names.qualified(&names.relative_path),
                self.relative_path.clone(),
            ),
            (
                names.qualified(&names.total_chunks),
                self.total_chunks.to_string(),
            ),
        ]
    }

    /// 合并动态附加参数（同名覆盖）
    pub fn apply_extras(&mut self, extras: RequestExtras) {
        merge_pairs(&mut self.query, extras.query);
        merge_pairs(&mut self.headers, extras.headers);
    }
}

fn merge_pairs(target: &mut Vec<(String, String)>, extra: BTreeMap<String, String>) {
    for (key, value) in extra {
        match target.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => target.push((key, value)),
        }
    }
}

/// 探测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// 服务器是否已持有该分片
    pub present: bool,
}

/// 上传请求的响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// 状态码是否属于成功状态集合
    pub ok: bool,
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn new(ok: bool, status: u16, body: impl Into<String>) -> Self {
        Self {
            ok,
            status,
            body: body.into(),
        }
    }
}

/// 上传字节进度回报
#[derive(Clone)]
pub struct ProgressReporter {
    counter: Arc<ByteCounter>,
    notify: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl ProgressReporter {
    pub(crate) fn new(counter: Arc<ByteCounter>, notify: Option<Arc<dyn Fn() + Send + Sync>>) -> Self {
        Self { counter, notify }
    }

    /// 不关联任何分片的回报器
    pub fn detached() -> Self {
        Self {
            counter: Arc::new(ByteCounter::default()),
            notify: None,
        }
    }

    /// 报告已发送的累计字节数
    pub fn report(&self, loaded: u64) {
        self.counter.record(loaded);
        if let Some(notify) = &self.notify {
            notify();
        }
    }

    /// 当前记录的字节数
    pub fn loaded(&self) -> Option<u64> {
        self.counter.loaded()
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("loaded", &self.counter.loaded())
            .finish()
    }
}

/// 分片传输
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// 探测服务器是否已有该分片
    async fn probe(&self, meta: &ChunkMetadata) -> Result<ProbeOutcome>;

    /// 上传分片数据
    ///
    /// 网络层失败返回 `Err`，引擎按状态码 0 处理（可重试）
    async fn send(
        &self,
        meta: &ChunkMetadata,
        data: Vec<u8>,
        reporter: ProgressReporter,
    ) -> Result<TransportResponse>;
}

// =====================================================
// 钩子
// =====================================================

/// 按分片动态生成的附加查询参数与请求头
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestExtras {
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
}

/// 动态请求参数钩子
pub type RequestDecorator = Arc<dyn Fn(&ChunkMetadata) -> RequestExtras + Send + Sync>;

/// 分片预处理（如加密、压缩前的准备工作），完成后分片才会被发送
#[async_trait]
pub trait ChunkPreprocessor: Send + Sync {
    async fn preprocess(&self, meta: &ChunkMetadata) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> ChunkMetadata {
        ChunkMetadata {
            chunk_number: 2,
            chunk_size: 1024,
            current_chunk_size: 512,
            total_size: 1536,
            mime_type: "text/plain".to_string(),
            identifier: "1536-notestxt".to_string(),
            file_name: "notes.txt".to_string(),
            relative_path: "docs/notes.txt".to_string(),
            total_chunks: 2,
            byte_range: 1024..1536,
            query: vec![("token".to_string(), "abc".to_string())],
            headers: Vec::new(),
        }
    }

    #[test]
    fn test_parameters_use_configured_names() {
        let meta = sample_meta();
        let names = ParameterNames {
            prefix: "up_".to_string(),
            ..Default::default()
        };
        let params = meta.parameters(&names);

        assert_eq!(params.len(), 9);
        assert_eq!(
            params[0],
            ("up_resumableChunkNumber".to_string(), "2".to_string())
        );
        assert!(params.contains(&("up_resumableCurrentChunkSize".to_string(), "512".to_string())));
        assert!(params.contains(&("up_resumableRelativePath".to_string(), "docs/notes.txt".to_string())));
    }

    #[test]
    fn test_apply_extras_overrides_existing() {
        let mut meta = sample_meta();
        meta.apply_extras(RequestExtras {
            query: BTreeMap::from([
                ("token".to_string(), "dynamic".to_string()),
                ("part".to_string(), "2".to_string()),
            ]),
            headers: BTreeMap::from([("X-Trace".to_string(), "t1".to_string())]),
        });

        assert_eq!(
            meta.query,
            vec![
                ("token".to_string(), "dynamic".to_string()),
                ("part".to_string(), "2".to_string()),
            ]
        );
        assert_eq!(meta.headers, vec![("X-Trace".to_string(), "t1".to_string())]);
    }

    #[test]
    fn test_reporter_records_bytes() {
        let reporter = ProgressReporter::detached();
        assert_eq!(reporter.loaded(), None);
        reporter.report(300);
        assert_eq!(reporter.loaded(), Some(300));
    }
}
