// 上传引擎错误类型

use crate::uploader::FileId;

/// 添加文件时的策略校验失败（同步返回，不进入事件流，不重试）
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("文件数量超过上限: 最多 {max} 个，本次共 {attempted} 个")]
    TooManyFiles { max: usize, attempted: usize },

    #[error("文件过小: {name} ({size} bytes)，最小 {min} bytes")]
    FileTooSmall { name: String, size: u64, min: u64 },

    #[error("文件过大: {name} ({size} bytes)，最大 {max} bytes")]
    FileTooLarge { name: String, size: u64, max: u64 },

    #[error("不允许的文件类型: {name}，允许: {}", allowed.join(", "))]
    DisallowedType { name: String, allowed: Vec<String> },
}

/// 上传引擎错误
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    #[error("文件不存在: {0}")]
    FileNotFound(FileId),

    #[error("计算文件标识失败: {0}")]
    Identifier(String),

    #[error("配置无效: {0}")]
    InvalidConfig(String),
}
