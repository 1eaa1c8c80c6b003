// 分片调度
//
// 选择下一个要发出的分片。调度器本身不持有状态，由会话在状态锁内调用：
// - 开启首尾优先时，先按文件顺序找每个文件的首分片和尾分片
// - 否则按文件顺序、分片序号顺序找第一个可调度的分片
// - 暂停、出错、仍在构建分片的文件不参与调度

use crate::uploader::file::FileUpload;

/// 被选中的分片
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pick {
    /// 文件在会话列表中的位置
    pub file_pos: usize,
    pub chunk_index: usize,
}

/// 选择下一个要发出的分片
pub fn pick_next(files: &[FileUpload], prioritize_edges: bool) -> Option<Pick> {
    if prioritize_edges {
        if let Some(pick) = pick_edge(files) {
            return Some(pick);
        }
    }

    files
        .iter()
        .enumerate()
        .filter(|(_, file)| file.is_schedulable())
        .find_map(|(file_pos, file)| {
            file.chunks()
                .iter()
                .position(|c| c.is_dispatchable())
                .map(|chunk_index| Pick {
                    file_pos,
                    chunk_index,
                })
        })
}

fn pick_edge(files: &[FileUpload]) -> Option<Pick> {
    for (file_pos, file) in files.iter().enumerate() {
        if !file.is_schedulable() {
            continue;
        }
        let chunks = file.chunks();
        let Some(last) = chunks.len().checked_sub(1) else {
            continue;
        };

        let mut edges = vec![0];
        if last > 0 {
            edges.push(last);
        }
        if let Some(chunk_index) = edges.into_iter().find(|&i| chunks[i].is_dispatchable()) {
            return Some(Pick {
                file_pos,
                chunk_index,
            });
        }
    }
    None
}

/// 正在探测或发送的分片总数
pub fn in_flight_count(files: &[FileUpload]) -> usize {
    files
        .iter()
        .map(|f| f.chunks().iter().filter(|c| c.is_in_flight()).count())
        .sum()
}

/// 是否还有未完成的文件
pub fn has_outstanding(files: &[FileUpload]) -> bool {
    files.iter().any(|f| !f.is_complete())
}
