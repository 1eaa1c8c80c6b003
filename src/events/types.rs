//! 上传事件类型定义

use crate::uploader::FileId;
use serde::{Deserialize, Serialize};

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：进度更新
    Low = 0,
    /// 中优先级：状态变更
    Medium = 1,
    /// 高优先级：完成、失败、取消等关键事件
    High = 2,
}

/// 事件类型（监听器表的键）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FileAdded,
    FilesAdded,
    ChunkingStart,
    ChunkingProgress,
    ChunkingComplete,
    ChunkProgress,
    FileProgress,
    FileSuccess,
    FileError,
    FileRetry,
    PreprocessStalled,
    UploadStart,
    Progress,
    Pause,
    BeforeCancel,
    Cancel,
    Complete,
}

/// 上传会话事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 文件加入队列
    FileAdded {
        file_id: FileId,
        identifier: String,
        file_name: String,
        total_size: u64,
    },
    /// 一批文件添加完成（包含被跳过的重复文件）
    FilesAdded {
        added: Vec<FileId>,
        /// 被跳过的重复文件名
        skipped: Vec<String>,
    },
    /// 开始切分分片
    ChunkingStart { file_id: FileId },
    /// 分片切分进度
    ChunkingProgress { file_id: FileId, progress: f64 },
    /// 分片切分完成
    ChunkingComplete { file_id: FileId, total_chunks: usize },
    /// 分片进度
    ChunkProgress {
        file_id: FileId,
        chunk_index: usize,
        progress: f64,
    },
    /// 文件进度
    FileProgress { file_id: FileId, progress: f64 },
    /// 文件上传成功（message 为最后一个分片的响应内容）
    FileSuccess { file_id: FileId, message: String },
    /// 文件上传失败
    FileError { file_id: FileId, message: String },
    /// 分片失败后重新排队
    FileRetry {
        file_id: FileId,
        chunk_index: usize,
        retry_count: u32,
    },
    /// 分片预处理失败，分片停滞，需要对文件调用 retry
    PreprocessStalled {
        file_id: FileId,
        chunk_index: usize,
        error: String,
    },
    /// 会话开始上传
    UploadStart,
    /// 会话进度
    Progress { progress: f64 },
    /// 会话暂停
    Pause,
    /// 即将取消
    BeforeCancel,
    /// 会话已取消
    Cancel,
    /// 所有文件处理完毕
    Complete,
}

impl UploadEvent {
    /// 获取事件关联的文件 ID
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            UploadEvent::FileAdded { file_id, .. }
            | UploadEvent::ChunkingStart { file_id }
            | UploadEvent::ChunkingProgress { file_id, .. }
            | UploadEvent::ChunkingComplete { file_id, .. }
            | UploadEvent::ChunkProgress { file_id, .. }
            | UploadEvent::FileProgress { file_id, .. }
            | UploadEvent::FileSuccess { file_id, .. }
            | UploadEvent::FileError { file_id, .. }
            | UploadEvent::FileRetry { file_id, .. }
            | UploadEvent::PreprocessStalled { file_id, .. } => Some(*file_id),
            UploadEvent::FilesAdded { .. }
            | UploadEvent::UploadStart
            | UploadEvent::Progress { .. }
            | UploadEvent::Pause
            | UploadEvent::BeforeCancel
            | UploadEvent::Cancel
            | UploadEvent::Complete => None,
        }
    }

    /// 获取事件类型
    pub fn kind(&self) -> EventKind {
        match self {
            UploadEvent::FileAdded { .. } => EventKind::FileAdded,
            UploadEvent::FilesAdded { .. } => EventKind::FilesAdded,
            UploadEvent::ChunkingStart { .. } => EventKind::ChunkingStart,
            UploadEvent::ChunkingProgress { .. } => EventKind::ChunkingProgress,
            UploadEvent::ChunkingComplete { .. } => EventKind::ChunkingComplete,
            UploadEvent::ChunkProgress { .. } => EventKind::ChunkProgress,
            UploadEvent::FileProgress { .. } => EventKind::FileProgress,
            UploadEvent::FileSuccess { .. } => EventKind::FileSuccess,
            UploadEvent::FileError { .. } => EventKind::FileError,
            UploadEvent::FileRetry { .. } => EventKind::FileRetry,
            UploadEvent::PreprocessStalled { .. } => EventKind::PreprocessStalled,
            UploadEvent::UploadStart => EventKind::UploadStart,
            UploadEvent::Progress { .. } => EventKind::Progress,
            UploadEvent::Pause => EventKind::Pause,
            UploadEvent::BeforeCancel => EventKind::BeforeCancel,
            UploadEvent::Cancel => EventKind::Cancel,
            UploadEvent::Complete => EventKind::Complete,
        }
    }

    /// 获取事件优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            UploadEvent::ChunkingProgress { .. }
            | UploadEvent::ChunkProgress { .. }
            | UploadEvent::FileProgress { .. }
            | UploadEvent::Progress { .. } => EventPriority::Low,
            UploadEvent::FileAdded { .. }
            | UploadEvent::FilesAdded { .. }
            | UploadEvent::ChunkingStart { .. }
            | UploadEvent::ChunkingComplete { .. }
            | UploadEvent::FileRetry { .. }
            | UploadEvent::UploadStart
            | UploadEvent::Pause
            | UploadEvent::BeforeCancel => EventPriority::Medium,
            UploadEvent::FileSuccess { .. }
            | UploadEvent::FileError { .. }
            | UploadEvent::PreprocessStalled { .. }
            | UploadEvent::Cancel
            | UploadEvent::Complete => EventPriority::High,
        }
    }
}
