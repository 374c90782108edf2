//! 音频核心模块
//!
//! 包含：
//! - Format: PCM 格式、样本编解码、声道/位深映射
//! - Mixer: 叠加混音与刷新节拍
//! - Stats: 音频源统计

pub mod format;
pub mod mixer;
pub mod stats;

pub use format::{FormatError, WaveFormat};
pub use mixer::{mix_into, RefillPacer};
pub use stats::{SourceStats, StatsReport};
