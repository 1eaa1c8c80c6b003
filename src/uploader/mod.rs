// 上传引擎模块
//
// - source: 可按字节范围读取的数据源与文件标识
// - chunk: 分片状态机与分片请求
// - file: 单个文件的进度、完成判定与暂停/出错状态
// - scheduler: 选择下一个要发出的分片
// - session: 上传会话（并发预算、调度、事件）
// - transport / http: 分片传输接口与 reqwest 实现
// - validation: 添加文件时的策略校验

pub mod chunk;
pub mod error;
pub mod file;
pub mod http;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod transport;
pub mod validation;

#[cfg(test)]
pub(crate) mod mock;

pub use chunk::{
    chunk_count, chunk_range, partition, Chunk, ChunkState, ChunkVerdict, PreprocessState,
    OPTIMISTIC_PROGRESS,
};
pub use error::{PolicyViolation, UploadError};
pub use file::{FileId, FileSnapshot, FileUpload};
pub use http::HttpTransport;
pub use session::{AddOutcome, AddReport, SessionHooks, UploadSession};
pub use source::{
    default_identifier, FileSource, IdentifierHook, IdentifierResult, LocalFileSource,
    MemorySource,
};
pub use transport::{
    ChunkMetadata, ChunkPreprocessor, ChunkTransport, ProbeOutcome, ProgressReporter,
    RequestDecorator, RequestExtras, TransportResponse,
};
