// 配置管理模块
//
// 上传引擎的静态策略：分片大小、并发上限、重试与错误分类、文件过滤规则
// 以及日志配置。配置本身无状态，由会话、文件、分片共同读取。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 默认分片大小: 1MB
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// 默认同时上传的分片数
pub const DEFAULT_SIMULTANEOUS_UPLOADS: usize = 3;

/// 默认最大重试次数
pub const DEFAULT_MAX_CHUNK_RETRIES: u32 = 100;

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 分片请求的负载编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// multipart 表单：元数据作为表单字段，分片作为二进制文件字段
    Multipart,
    /// 原始字节流：元数据放在查询参数中，Content-Type 固定为 application/octet-stream
    Octet,
}

/// 重试退避策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryBackoff {
    /// 立即重新排队
    None,
    /// 固定间隔
    Fixed { interval_ms: u64 },
    /// 指数退避：initial * 2^retry，上限 max
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff::None
    }
}

impl RetryBackoff {
    /// 第 `retry_count` 次重试前的等待时间，`None` 表示立即重新调度
    ///
    /// # 延迟序列（指数）
    /// - retry_count=0: initial
    /// - retry_count=1: initial * 2
    /// - 最大: max
    pub fn delay(&self, retry_count: u32) -> Option<Duration> {
        match self {
            RetryBackoff::None => None,
            RetryBackoff::Fixed { interval_ms } => Some(Duration::from_millis(*interval_ms)),
            RetryBackoff::Exponential { initial_ms, max_ms } => {
                let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
                let delay = initial_ms.saturating_mul(factor).min(*max_ms);
                Some(Duration::from_millis(delay))
            }
        }
    }

    /// 默认的指数退避参数（100ms 起，5s 封顶）
    pub fn exponential() -> Self {
        RetryBackoff::Exponential {
            initial_ms: INITIAL_BACKOFF_MS,
            max_ms: MAX_BACKOFF_MS,
        }
    }
}

/// 分片元数据字段名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterNames {
    /// 所有字段名的统一前缀
    pub prefix: String,
    pub chunk_number: String,
    pub chunk_size: String,
    pub current_chunk_size: String,
    pub total_size: String,
    pub mime_type: String,
    pub identifier: String,
    pub file_name: String,
    pub relative_path: String,
    pub total_chunks: String,
}

impl Default for ParameterNames {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            chunk_number: "resumableChunkNumber".to_string(),
            chunk_size: "resumableChunkSize".to_string(),
            current_chunk_size: "resumableCurrentChunkSize".to_string(),
            total_size: "resumableTotalSize".to_string(),
            mime_type: "resumableType".to_string(),
            identifier: "resumableIdentifier".to_string(),
            file_name: "resumableFilename".to_string(),
            relative_path: "resumableRelativePath".to_string(),
            total_chunks: "resumableTotalChunks".to_string(),
        }
    }
}

impl ParameterNames {
    /// 带前缀的完整字段名
    pub fn qualified(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 上传目标地址
    pub target: String,
    /// 分片大小（字节）
    pub chunk_size: u64,
    /// 全局最大同时上传分片数
    pub simultaneous_uploads: usize,
    /// 发送数据前先探测服务器是否已有该分片（断点续传）
    pub test_chunks: bool,
    /// 优先上传每个文件的首尾分片
    pub prioritize_first_and_last_chunk: bool,
    /// 单个分片最大重试次数
    pub max_chunk_retries: u32,
    /// 重试退避策略
    pub retry_backoff: RetryBackoff,
    /// 不可重试的状态码
    pub permanent_errors: Vec<u16>,
    /// 视为成功的状态码
    pub success_statuses: Vec<u16>,
    /// 会话最多文件数
    pub max_files: Option<usize>,
    /// 最小文件大小（字节）
    pub min_file_size: u64,
    /// 最大文件大小（字节）
    pub max_file_size: Option<u64>,
    /// 允许的文件类型（扩展名或 MIME，如 "jpg"、"image/*"），为空表示不限制
    pub file_types: Vec<String>,
    /// 负载编码方式
    pub encoding: PayloadEncoding,
    /// 元数据字段名
    pub parameter_names: ParameterNames,
    /// multipart 模式下分片数据的字段名
    pub file_parameter_name: String,
    /// 上传请求方法
    pub upload_method: String,
    /// 探测请求方法
    pub test_method: String,
    /// 附加到每个请求的静态查询参数
    pub query: BTreeMap<String, String>,
    /// 附加到每个请求的静态请求头
    pub headers: BTreeMap<String, String>,
    /// 单个请求超时（秒），0 表示不限制
    pub request_timeout_secs: u64,
    /// 进度事件最小间隔（毫秒）
    pub progress_interval_ms: u64,
    /// 每轮构建的分片数，构建完一批后让出执行权
    pub chunking_batch_size: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            target: "/".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            simultaneous_uploads: DEFAULT_SIMULTANEOUS_UPLOADS,
            test_chunks: true,
            prioritize_first_and_last_chunk: false,
            max_chunk_retries: DEFAULT_MAX_CHUNK_RETRIES,
            retry_backoff: RetryBackoff::None,
            permanent_errors: vec![400, 404, 409, 415, 500, 501],
            success_statuses: vec![200, 201, 202],
            max_files: None,
            min_file_size: 1,
            max_file_size: None,
            file_types: Vec::new(),
            encoding: PayloadEncoding::Multipart,
            parameter_names: ParameterNames::default(),
            file_parameter_name: "file".to_string(),
            upload_method: "POST".to_string(),
            test_method: "GET".to_string(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            request_timeout_secs: 0,
            progress_interval_ms: 500,
            chunking_batch_size: 256,
        }
    }
}

/// 单个文件对会话配置的覆盖项
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOverrides {
    pub chunk_size: Option<u64>,
    pub test_chunks: Option<bool>,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
}

/// 文件生效配置（会话配置叠加文件覆盖项，创建文件时计算一次）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOptions {
    pub chunk_size: u64,
    pub test_chunks: bool,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
}

impl UploadConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size 必须大于 0".to_string());
        }
        if self.simultaneous_uploads == 0 {
            return Err("simultaneous_uploads 必须大于 0".to_string());
        }
        if self.chunking_batch_size == 0 {
            return Err("chunking_batch_size 必须大于 0".to_string());
        }
        if let (Some(max), min) = (self.max_file_size, self.min_file_size) {
            if max < min {
                return Err(format!(
                    "max_file_size ({}) 小于 min_file_size ({})",
                    max, min
                ));
            }
        }
        Ok(())
    }

    /// 计算文件生效配置：文件覆盖项优先，其次会话配置
    pub fn resolve(&self, overrides: &FileOverrides) -> FileOptions {
        let mut query = self.query.clone();
        query.extend(overrides.query.clone());
        let mut headers = self.headers.clone();
        headers.extend(overrides.headers.clone());

        FileOptions {
            chunk_size: overrides
                .chunk_size
                .filter(|size| *size > 0)
                .unwrap_or(self.chunk_size),
            test_chunks: overrides.test_chunks.unwrap_or(self.test_chunks),
            query,
            headers,
        }
    }

    /// 状态码是否为不可重试错误
    pub fn is_permanent_error(&self, status: u16) -> bool {
        self.permanent_errors.contains(&status)
    }

    /// 状态码是否表示成功
    pub fn is_success_status(&self, status: u16) -> bool {
        self.success_statuses.contains(&status)
    }

    /// 请求超时
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

impl UploaderConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: UploaderConfig =
            toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .map_err(anyhow::Error::msg)
            .context("配置文件中的上传配置无效")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_upload_config() {
        let config = UploadConfig::default();
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.simultaneous_uploads, 3);
        assert!(config.test_chunks);
        assert_eq!(config.permanent_errors, vec![400, 404, 409, 415, 500, 501]);
        assert_eq!(config.encoding, PayloadEncoding::Multipart);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = UploadConfig::default();
        config.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = UploadConfig::default();
        config.simultaneous_uploads = 0;
        assert!(config.validate().is_err());

        let mut config = UploadConfig::default();
        config.min_file_size = 10;
        config.max_file_size = Some(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_delays() {
        assert_eq!(RetryBackoff::None.delay(3), None);
        assert_eq!(
            RetryBackoff::Fixed { interval_ms: 250 }.delay(7),
            Some(Duration::from_millis(250))
        );

        let backoff = RetryBackoff::exponential();
        assert_eq!(backoff.delay(0), Some(Duration::from_millis(100)));
        assert_eq!(backoff.delay(1), Some(Duration::from_millis(200)));
        assert_eq!(backoff.delay(2), Some(Duration::from_millis(400)));
        assert_eq!(backoff.delay(10), Some(Duration::from_millis(5000)));
        // 溢出时封顶
        assert_eq!(backoff.delay(200), Some(Duration::from_millis(5000)));
    }

    #[test]
    fn test_resolve_file_overrides() {
        let mut config = UploadConfig::default();
        config.query.insert("token".to_string(), "abc".to_string());
        config.headers.insert("X-Session".to_string(), "s1".to_string());

        let overrides = FileOverrides {
            chunk_size: Some(4096),
            test_chunks: Some(false),
            query: BTreeMap::from([("token".to_string(), "override".to_string())]),
            headers: BTreeMap::new(),
        };

        let options = config.resolve(&overrides);
        assert_eq!(options.chunk_size, 4096);
        assert!(!options.test_chunks);
        assert_eq!(options.query.get("token").map(String::as_str), Some("override"));
        assert_eq!(options.headers.get("X-Session").map(String::as_str), Some("s1"));

        // 覆盖项为 0 时回退到会话配置
        let options = config.resolve(&FileOverrides {
            chunk_size: Some(0),
            ..Default::default()
        });
        assert_eq!(options.chunk_size, config.chunk_size);
        assert!(options.test_chunks);
    }

    #[test]
    fn test_parameter_prefix() {
        let names = ParameterNames {
            prefix: "x_".to_string(),
            ..Default::default()
        };
        assert_eq!(names.qualified(&names.chunk_number), "x_resumableChunkNumber");
    }

    #[tokio::test]
    async fn test_load_from_toml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[upload]
target = "http://localhost:8080/upload"
chunk_size = 2048
simultaneous_uploads = 2
encoding = "octet"
permanent_errors = [400, 413]

[upload.retry_backoff]
kind = "fixed"
interval_ms = 300

[log]
level = "debug"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let config = UploaderConfig::load_from_file(path).await.unwrap();
        assert_eq!(config.upload.target, "http://localhost:8080/upload");
        assert_eq!(config.upload.chunk_size, 2048);
        assert_eq!(config.upload.simultaneous_uploads, 2);
        assert_eq!(config.upload.encoding, PayloadEncoding::Octet);
        assert_eq!(config.upload.permanent_errors, vec![400, 413]);
        assert_eq!(
            config.upload.retry_backoff,
            RetryBackoff::Fixed { interval_ms: 300 }
        );
        // 未配置的字段使用默认值
        assert_eq!(config.upload.success_statuses, vec![200, 201, 202]);
        assert_eq!(config.log.level, "debug");
    }

    #[tokio::test]
    async fn test_load_invalid_config_falls_back_to_default() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[upload]\nchunk_size = 0").unwrap();

        let path = file.path().to_str().unwrap();
        assert!(UploaderConfig::load_from_file(path).await.is_err());

        let config = UploaderConfig::load_or_default(path).await;
        assert_eq!(config.upload.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("uploader.toml");
        let path = path.to_str().unwrap();

        let mut config = UploaderConfig::default();
        config.upload.max_files = Some(5);
        config.upload.retry_backoff = RetryBackoff::exponential();
        config.save_to_file(path).await.unwrap();

        let loaded = UploaderConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.max_files, Some(5));
        assert_eq!(loaded.upload.retry_backoff, RetryBackoff::exponential());
    }
}
