// Resumable Uploader Library
// 分片断点续传上传引擎核心库

// 配置管理模块
pub mod config;

// 会话事件模块
pub mod events;

// 日志系统
pub mod logging;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{FileOverrides, UploadConfig, UploaderConfig};
pub use events::{EventKind, UploadEvent};
pub use uploader::{
    FileId, FileSnapshot, FileSource, HttpTransport, LocalFileSource, MemorySource,
    UploadError, UploadSession,
};
