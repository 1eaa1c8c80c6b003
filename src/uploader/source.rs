// 上传数据源
//
// 引擎只认识扁平的"类文件"数据源：可按字节范围读取，带大小、文件名、
// 相对路径和 MIME 类型。目录遍历等由外部协作者完成。

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// 默认 MIME 类型
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// 可按字节范围读取的数据源
#[async_trait]
pub trait FileSource: Send + Sync + fmt::Debug {
    /// 文件名
    fn name(&self) -> &str;

    /// 相对于上传根目录的路径
    fn relative_path(&self) -> &str {
        self.name()
    }

    /// 文件大小（字节）
    fn size(&self) -> u64;

    /// MIME 类型
    fn mime_type(&self) -> &str {
        DEFAULT_MIME_TYPE
    }

    /// 读取 `[start, end)` 范围内的数据
    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>>;
}

/// 本地文件数据源
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    path: PathBuf,
    name: String,
    relative_path: String,
    size: u64,
    mime_type: String,
}

impl LocalFileSource {
    /// 打开本地文件（读取元数据，不保持文件句柄）
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("读取文件元数据失败: {:?}", path))?;

        if !metadata.is_file() {
            anyhow::bail!("不是普通文件: {:?}", path);
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            mime_type: guess_mime_type(&name).to_string(),
            relative_path: name.clone(),
            name,
            size: metadata.len(),
            path,
        })
    }

    /// 设置相对路径（由目录遍历方提供）
    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = relative_path.into();
        self
    }

}

#[async_trait]
impl FileSource for LocalFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn relative_path(&self) -> &str {
        &self.relative_path
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};

        let path = self.path.clone();
        let start = range.start;
        let size = range.end.saturating_sub(range.start) as usize;

        let data = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut file = std::fs::File::open(&path)
                .with_context(|| format!("无法打开文件 {:?}", path))?;
            file.seek(SeekFrom::Start(start)).context("文件定位失败")?;

            let mut buffer = vec![0u8; size];
            file.read_exact(&mut buffer).context("读取分片数据失败")?;
            Ok(buffer)
        })
        .await
        .context("读取分片任务异常退出")??;

        debug!(
            "读取分片数据: file={}, bytes={}-{}, 大小={} bytes",
            self.name,
            range.start,
            range.end,
            data.len()
        );

        Ok(data)
    }
}

/// 内存数据源
#[derive(Clone)]
pub struct MemorySource {
    name: String,
    relative_path: String,
    mime_type: String,
    data: Arc<Vec<u8>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let name = name.into();
        Self {
            mime_type: guess_mime_type(&name).to_string(),
            relative_path: name.clone(),
            name,
            data: Arc::new(data.into()),
        }
    }

    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = relative_path.into();
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("name", &self.name)
            .field("relative_path", &self.relative_path)
            .field("size", &self.data.len())
            .finish()
    }
}

#[async_trait]
impl FileSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn relative_path(&self) -> &str {
        &self.relative_path
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        let len = self.data.len() as u64;
        if range.start > range.end || range.end > len {
            anyhow::bail!(
                "读取范围越界: {}-{}, 文件大小={}",
                range.start,
                range.end,
                len
            );
        }
        Ok(self.data[range.start as usize..range.end as usize].to_vec())
    }
}

/// 根据扩展名粗略推断 MIME 类型
pub fn guess_mime_type(name: &str) -> &'static str {
    match file_extension(name).as_deref() {
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        _ => DEFAULT_MIME_TYPE,
    }
}

/// 小写扩展名（不含点）
pub fn file_extension(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

// =====================================================
// 文件标识
// =====================================================

/// 标识计算结果：同步得出或需要等待的异步计算
pub enum IdentifierResult {
    Ready(Result<String>),
    Pending(BoxFuture<'static, Result<String>>),
}

impl IdentifierResult {
    /// 得到最终标识
    pub async fn resolve(self) -> Result<String> {
        match self {
            IdentifierResult::Ready(result) => result,
            IdentifierResult::Pending(future) => future.await,
        }
    }
}

impl fmt::Debug for IdentifierResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierResult::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            IdentifierResult::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// 自定义文件标识钩子
pub type IdentifierHook = Arc<dyn Fn(&dyn FileSource) -> IdentifierResult + Send + Sync>;

/// 默认文件标识：`<size>-<relative_path 中的字母数字、下划线和连字符>`
pub fn default_identifier(size: u64, relative_path: &str) -> String {
    let cleaned: String = relative_path
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    format!("{}-{}", size, cleaned)
}
