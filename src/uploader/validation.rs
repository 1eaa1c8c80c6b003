// 添加文件时的策略校验

use crate::config::UploadConfig;
use crate::uploader::error::PolicyViolation;
use crate::uploader::source::{file_extension, FileSource};

/// 文件数量校验结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountDecision {
    /// 直接加入
    Accept,
    /// 单文件会话：用新文件替换已有文件
    ReplaceExisting,
}

/// 校验本批次加入后文件数量是否超限
pub fn check_file_count(
    max_files: Option<usize>,
    existing: usize,
    incoming: usize,
) -> Result<CountDecision, PolicyViolation> {
    let Some(max) = max_files else {
        return Ok(CountDecision::Accept);
    };

    if existing + incoming <= max {
        return Ok(CountDecision::Accept);
    }

    if max == 1 && existing == 1 && incoming == 1 {
        return Ok(CountDecision::ReplaceExisting);
    }

    Err(PolicyViolation::TooManyFiles {
        max,
        attempted: existing + incoming,
    })
}

/// 文件类型是否在允许列表中
///
/// 列表项可以是扩展名（`jpg` / `.jpg`）、完整 MIME（`image/png`）或
/// MIME 通配（`image/*`），大小写不敏感
pub fn type_allowed(file_types: &[String], name: &str, mime_type: &str) -> bool {
    if file_types.is_empty() {
        return true;
    }

    let extension = file_extension(name);
    let mime_type = mime_type.to_lowercase();

    file_types.iter().any(|allowed| {
        let allowed = allowed.trim().to_lowercase();
        if let Some(prefix) = allowed.strip_suffix("/*") {
            return mime_type
                .split_once('/')
                .is_some_and(|(major, _)| major == prefix);
        }
        if allowed.contains('/') {
            return mime_type == allowed;
        }
        let allowed = allowed.trim_start_matches('.');
        extension.as_deref() == Some(allowed)
    })
}

/// 校验单个文件：类型、最小大小、最大大小
pub fn check_source(config: &UploadConfig, source: &dyn FileSource) -> Result<(), PolicyViolation> {
    let name = source.name();

    if !type_allowed(&config.file_types, name, source.mime_type()) {
        return Err(PolicyViolation::DisallowedType {
            name: name.to_string(),
            allowed: config.file_types.clone(),
        });
    }

    let size = source.size();
    if size < config.min_file_size {
        return Err(PolicyViolation::FileTooSmall {
            name: name.to_string(),
            size,
            min: config.min_file_size,
        });
    }

    if let Some(max) = config.max_file_size {
        if size > max {
            return Err(PolicyViolation::FileTooLarge {
                name: name.to_string(),
                size,
                max,
            });
        }
    }

    Ok(())
}
