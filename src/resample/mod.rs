//! 重采样模块
//!
//! 整数定点的多级有理比例重采样：
//! - filter: 窗函数 Sinc FIR 设计
//! - ratio: 采样率比例分解与分级规划
//! - polyphase: 单级多相插值/抽取
//! - converter: 声道、位深、采样率的完整格式转换

pub mod converter;
pub mod filter;
pub mod polyphase;
pub mod ratio;

use thiserror::Error;

use crate::audio::FormatError;

pub use converter::FormatConverter;
pub use filter::FirFilter;
pub use polyphase::{DelayLine, PolyphaseConverter};
pub use ratio::{plan_rates, Factor, ScalingStage};

/// 重采样错误
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResampleError {
    #[error("filter needs at least one tap (got {0})")]
    InvalidTaps(usize),
    #[error("invalid filter frequencies: cutoff {cutoff}, sample {sample}")]
    InvalidFrequency { cutoff: f64, sample: f64 },
    #[error("value {value} has a prime factor outside the supported table")]
    UnrepresentableRatio { value: u32 },
    #[error(transparent)]
    Format(#[from] FormatError),
}

/// 转换器配置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConverterConfig {
    /// 每个多相分支的抽头数
    pub taps_per_phase: usize,
    /// 单次内部处理的最大输入块数（决定中间缓冲区大小）
    pub max_blocks: usize,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            taps_per_phase: 16,
            max_blocks: 4096,
        }
    }
}
