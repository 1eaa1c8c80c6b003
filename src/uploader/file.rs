// 单个文件的上传状态
//
// 文件持有有序的分片列表，负责汇总文件级进度、完成判定、暂停和出错状态。
// 分片列表在文件创建后异步构建，构建期间列表为空。

use crate::config::FileOptions;
use crate::uploader::chunk::{Chunk, ChunkState};
use crate::uploader::source::FileSource;
use crate::uploader::transport::ChunkMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 进度视为完成的阈值
const COMPLETE_THRESHOLD: f64 = 0.99999;

/// 会话内唯一的文件 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 文件状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileSnapshot {
    pub id: FileId,
    pub identifier: String,
    pub file_name: String,
    pub relative_path: String,
    pub size: u64,
    pub progress: f64,
    pub total_chunks: usize,
    pub completed_chunks: usize,
    pub is_paused: bool,
    pub is_chunking: bool,
    pub is_uploading: bool,
    pub is_complete: bool,
    pub error: Option<String>,
}

/// 上传文件
pub struct FileUpload {
    pub id: FileId,
    pub source: Arc<dyn FileSource>,
    pub identifier: String,
    pub options: Arc<FileOptions>,
    chunks: Vec<Chunk>,
    paused: bool,
    error: Option<String>,
    chunking: bool,
    /// 分片列表版本，重建后旧的构建任务结果作废
    generation: u64,
    /// 进度高水位
    prev_progress: f64,
}

impl FileUpload {
    pub fn new(
        id: FileId,
        source: Arc<dyn FileSource>,
        identifier: String,
        options: Arc<FileOptions>,
    ) -> Self {
        Self {
            id,
            source,
            identifier,
            options,
            chunks: Vec::new(),
            paused: false,
            error: None,
            chunking: true,
            generation: 0,
            prev_progress: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn size(&self) -> u64 {
        self.source.size()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk_mut(&mut self, index: usize) -> Option<&mut Chunk> {
        self.chunks.get_mut(index)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_chunking(&self) -> bool {
        self.chunking
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 可以参与调度
    pub fn is_schedulable(&self) -> bool {
        !self.paused && self.error.is_none() && !self.chunking
    }

    fn computed_progress(&self) -> f64 {
        if self.error.is_some() || self.chunks.iter().any(|c| c.state() == ChunkState::Error) {
            return 1.0;
        }
        if self.chunks.is_empty() {
            return 0.0;
        }

        let size = self.size();
        let total = if size == 0 {
            self.chunks.iter().map(Chunk::progress).sum::<f64>() / self.chunks.len() as f64
        } else {
            self.chunks
                .iter()
                .map(|c| c.progress() * c.size() as f64 / size as f64)
                .sum()
        };

        if total > COMPLETE_THRESHOLD {
            1.0
        } else {
            total
        }
    }

    /// 文件进度 [0, 1]，不低于之前报告过的值
    pub fn progress(&mut self) -> f64 {
        let progress = self.computed_progress().max(self.prev_progress);
        self.prev_progress = progress;
        progress
    }

    /// 不更新高水位的进度
    pub fn peek_progress(&self) -> f64 {
        self.computed_progress().max(self.prev_progress)
    }

    /// 出错视为已完成；否则要求分片已构建且没有未完成的分片
    pub fn is_complete(&self) -> bool {
        if self.error.is_some() {
            return true;
        }
        !self.chunking && !self.chunks.iter().any(Chunk::is_outstanding)
    }

    /// 有分片正在探测或发送
    pub fn is_uploading(&self) -> bool {
        self.chunks.iter().any(Chunk::is_in_flight)
    }

    /// 中止所有进行中的分片，返回中止数量
    pub fn abort_in_flight(&mut self) -> usize {
        self.chunks.iter_mut().map(|c| usize::from(c.abort())).sum()
    }

    /// 标记文件失败并中止其余分片
    pub fn fail(&mut self, message: String) -> usize {
        self.error = Some(message);
        self.abort_in_flight()
    }

    /// 开始重建分片列表，返回新版本号
    pub fn begin_rebuild(&mut self) -> u64 {
        self.abort_in_flight();
        self.chunks.clear();
        self.error = None;
        self.prev_progress = 0.0;
        self.chunking = true;
        self.generation += 1;
        self.generation
    }

    /// 装入构建好的分片列表，版本号不匹配时丢弃
    pub fn install_chunks(&mut self, generation: u64, chunks: Vec<Chunk>) -> bool {
        if generation != self.generation {
            return false;
        }
        self.chunks = chunks;
        self.chunking = false;
        true
    }

    /// 生成分片请求元数据（不含动态参数）
    pub fn metadata_for(&self, index: usize) -> Option<ChunkMetadata> {
        let chunk = self.chunks.get(index)?;
        Some(ChunkMetadata {
            chunk_number: index + 1,
            chunk_size: self.options.chunk_size,
            current_chunk_size: chunk.size(),
            total_size: self.size(),
            mime_type: self.source.mime_type().to_string(),
            identifier: self.identifier.clone(),
            file_name: self.source.name().to_string(),
            relative_path: self.source.relative_path().to_string(),
            total_chunks: self.chunks.len(),
            byte_range: chunk.range.clone(),
            query: self
                .options
                .query
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            headers: self
                .options
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    pub fn snapshot(&self) -> FileSnapshot {
        FileSnapshot {
            id: self.id,
            identifier: self.identifier.clone(),
            file_name: self.source.name().to_string(),
            relative_path: self.source.relative_path().to_string(),
            size: self.size(),
            progress: self.peek_progress(),
            total_chunks: self.chunks.len(),
            completed_chunks: self
                .chunks
                .iter()
                .filter(|c| c.state() == ChunkState::Success)
                .count(),
            is_paused: self.paused,
            is_chunking: self.chunking,
            is_uploading: self.is_uploading(),
            is_complete: self.is_complete(),
            error: self.error.clone(),
        }
    }
}

impl fmt::Debug for FileUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileUpload")
            .field("id", &self.id)
            .field("identifier", &self.identifier)
            .field("chunks", &self.chunks.len())
            .field("paused", &self.paused)
            .field("error", &self.error)
            .field("chunking", &self.chunking)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileOverrides, UploadConfig};
    use crate::uploader::chunk::partition;
    use crate::uploader::source::MemorySource;
    use crate::uploader::transport::TransportResponse;

    fn file_with_chunks(size: usize, chunk_size: u64) -> FileUpload {
        let mut config = UploadConfig::default();
        config.query.insert("token".to_string(), "t".to_string());
        let options = Arc::new(config.resolve(&FileOverrides {
            chunk_size: Some(chunk_size),
            ..Default::default()
        }));
        let source = Arc::new(MemorySource::new("a.bin", vec![7u8; size]));
        let mut file = FileUpload::new(FileId(1), source, "id-a".to_string(), options);

        let chunks = partition(size as u64, chunk_size)
            .into_iter()
            .enumerate()
            .map(|(i, r)| Chunk::new(FileId(1), i, r))
            .collect();
        let generation = file.generation();
        assert!(file.install_chunks(generation, chunks));
        file
    }

    fn succeed(file: &mut FileUpload, index: usize) {
        let chunk = file.chunk_mut(index).unwrap();
        chunk.begin(index as u64 + 1, false);
        chunk.resolve(
            Ok(TransportResponse::new(true, 200, "")),
            &UploadConfig::default(),
        );
    }

    #[test]
    fn test_new_file_is_chunking() {
        let source = Arc::new(MemorySource::new("a.bin", vec![1u8; 10]));
        let options = Arc::new(UploadConfig::default().resolve(&FileOverrides::default()));
        let mut file = FileUpload::new(FileId(1), source, "id".to_string(), options);

        assert!(file.is_chunking());
        assert!(!file.is_complete());
        assert_eq!(file.progress(), 0.0);
    }

    #[test]
    fn test_weighted_progress_and_completion() {
        let mut file = file_with_chunks(300, 100);
        assert_eq!(file.chunks().len(), 3);

        succeed(&mut file, 0);
        assert!((file.progress() - 1.0 / 3.0).abs() < 1e-9);
        assert!(!file.is_complete());

        succeed(&mut file, 1);
        succeed(&mut file, 2);
        assert_eq!(file.progress(), 1.0);
        assert!(file.is_complete());
    }

    #[test]
    fn test_progress_high_water_mark() {
        let mut file = file_with_chunks(200, 100);
        file.chunk_mut(0).unwrap().begin(1, false);
        file.chunk_mut(0).unwrap().counter().record(80);
        let before = file.progress();
        assert!((before - 0.4).abs() < 1e-9);

        // 暂停中止后分片回到 pending，进度不回退
        assert_eq!(file.abort_in_flight(), 1);
        assert_eq!(file.progress(), before);
    }

    #[test]
    fn test_fail_forces_full_progress_and_completion() {
        let mut file = file_with_chunks(300, 100);
        file.chunk_mut(1).unwrap().begin(1, false);

        assert_eq!(file.fail("boom".to_string()), 1);
        assert_eq!(file.error(), Some("boom"));
        assert_eq!(file.progress(), 1.0);
        assert!(file.is_complete());
        assert!(!file.is_schedulable());
    }

    #[test]
    fn test_rebuild_discards_stale_generation() {
        let mut file = file_with_chunks(300, 100);
        file.fail("boom".to_string());

        let stale = file.generation();
        let fresh = file.begin_rebuild();
        assert!(file.error().is_none());
        assert!(file.is_chunking());
        assert!(!file.install_chunks(stale, Vec::new()));
        assert!(file.install_chunks(fresh, vec![Chunk::new(FileId(1), 0, 0..300)]));
        assert!(!file.is_chunking());
    }

    #[test]
    fn test_empty_file_single_chunk() {
        let mut file = file_with_chunks(0, 100);
        assert_eq!(file.chunks().len(), 1);
        assert_eq!(file.progress(), 0.0);
        succeed(&mut file, 0);
        assert_eq!(file.progress(), 1.0);
    }

    #[test]
    fn test_metadata_for_last_chunk() {
        let file = file_with_chunks(250, 100);
        let meta = file.metadata_for(2).unwrap();
        assert_eq!(meta.chunk_number, 3);
        assert_eq!(meta.chunk_size, 100);
        assert_eq!(meta.current_chunk_size, 50);
        assert_eq!(meta.total_size, 250);
        assert_eq!(meta.total_chunks, 3);
        assert_eq!(meta.byte_range, 200..250);
        assert_eq!(meta.identifier, "id-a");
        assert_eq!(meta.query, vec![("token".to_string(), "t".to_string())]);
        assert!(file.metadata_for(3).is_none());
    }
}
