//! 音频源统计模块
//!
//! 播放线程和转换线程分别写入不同的计数器，全部使用原子操作，
//! 每个计数器独占一个 cache line，避免 false sharing

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// 音频源统计收集器
///
/// 所有操作都是 lock-free 的，适合在 take（实时路径）中调用
#[derive(Default)]
pub struct SourceStats {
    // 播放侧
    blocks_taken: CachePadded<AtomicU64>,
    silence_blocks: CachePadded<AtomicU64>,
    underrun_count: CachePadded<AtomicU64>,

    // 转换侧
    nodes_converted: CachePadded<AtomicU64>,
    format_changes: CachePadded<AtomicU64>,
    conversion_failures: CachePadded<AtomicU64>,
}

impl SourceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次 take 的结果
    ///
    /// `real`: 实际复制的块数，`silence`: 填充的静音块数
    #[inline]
    pub fn record_take(&self, real: usize, silence: usize) {
        self.blocks_taken.fetch_add(real as u64, Ordering::Relaxed);
        if silence > 0 {
            self.silence_blocks.fetch_add(silence as u64, Ordering::Relaxed);
        }
    }

    /// 记录 underrun（数据尚未转换完成）
    #[inline]
    pub fn record_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_node_converted(&self) {
        self.nodes_converted.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录输入格式切换（转换链重建，延迟线历史丢失）
    #[inline]
    pub fn record_format_change(&self) {
        self.format_changes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_conversion_failure(&self) {
        self.conversion_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn format_changes(&self) -> u64 {
        self.format_changes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn nodes_converted(&self) -> u64 {
        self.nodes_converted.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self) -> StatsReport {
        StatsReport {
            blocks_taken: self.blocks_taken.load(Ordering::Relaxed),
            silence_blocks: self.silence_blocks.load(Ordering::Relaxed),
            underrun_count: self.underrun_count.load(Ordering::Relaxed),
            nodes_converted: self.nodes_converted.load(Ordering::Relaxed),
            format_changes: self.format_changes.load(Ordering::Relaxed),
            conversion_failures: self.conversion_failures.load(Ordering::Relaxed),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.blocks_taken.store(0, Ordering::Relaxed);
        self.silence_blocks.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
        self.nodes_converted.store(0, Ordering::Relaxed);
        self.format_changes.store(0, Ordering::Relaxed);
        self.conversion_failures.store(0, Ordering::Relaxed);
    }
}

/// 统计报告
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsReport {
    pub blocks_taken: u64,
    pub silence_blocks: u64,
    pub underrun_count: u64,
    pub nodes_converted: u64,
    pub format_changes: u64,
    pub conversion_failures: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Source Statistics")?;
        writeln!(f, "=================")?;
        writeln!(f, "Blocks taken: {}", self.blocks_taken)?;
        writeln!(f, "Silence blocks: {}", self.silence_blocks)?;
        writeln!(f, "Underruns: {}", self.underrun_count)?;
        writeln!(f, "Nodes converted: {}", self.nodes_converted)?;
        writeln!(f, "Format changes: {}", self.format_changes)?;
        writeln!(f, "Conversion failures: {}", self.conversion_failures)?;
        Ok(())
    }
}
