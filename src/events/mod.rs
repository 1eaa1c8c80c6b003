//! 事件模块
//!
//! 上传会话对外发布的生命周期事件
//! - `types.rs`: 事件类型定义
//! - `bus.rs`: 会话级监听器表（按事件类型注册 + 全量监听 + channel 订阅）
//! - `throttle.rs`: 进度事件节流

mod bus;
mod throttle;
mod types;

pub use bus::*;
pub use throttle::*;
pub use types::*;
