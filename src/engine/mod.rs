//! 流式音频源
//!
//! 三个线程访问同一个音频源：
//! - 追加线程：`add` / `add_async` 切块并链接到链尾
//! - 转换线程：沿 `proc` 把节点转换为目标格式
//! - 播放线程：每个刷新周期 `take` 一段已转换数据，永不等待转换
//!
//! 节点的转换结果发布后只读，`take` 沿链读取不持有链锁；
//! 只有链的结构修改（追加、裁剪、重建）需要链锁。
//! 锁顺序：播放游标 → 链

mod chain;
mod worker;

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use thiserror::Error;

use crate::audio::{FormatError, SourceStats, WaveFormat};
use crate::resample::{plan_rates, ConverterConfig, ResampleError};
use chain::{split, Chain, DataNode};
use worker::{convert_node, Conversion, Worker};

/// 音频源错误
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Resample(#[from] ResampleError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("input holds {actual} bytes, expected at least {expected}")]
    ShortInput { expected: usize, actual: usize },
    #[error("failed to spawn conversion worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

/// 音频源配置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceConfig {
    /// 播放完毕后不被回收，继续输出静音
    pub persist_when_empty: bool,
    /// 保留已播放的节点，支持 rewind
    pub buffered: bool,
    /// 播放到结尾自动回到开头
    pub looped: bool,
    /// 每个节点的最大块数
    pub node_blocks: usize,
    pub converter: ConverterConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            persist_when_empty: false,
            buffered: false,
            looped: false,
            node_blocks: 4096,
            converter: ConverterConfig::default(),
        }
    }
}

/// 转换线程与追加/播放侧共享的状态
pub(crate) struct Shared {
    chain: Mutex<Chain>,
    running: AtomicBool,
    stats: SourceStats,
    config: ConverterConfig,
}

/// 播放游标
struct Cursor {
    curr: Option<Arc<DataNode>>,
    /// curr 内已读取的块数（目标格式）
    offset: usize,
    /// 读到链尾时停在这里，等新节点链接到它后面
    last: Option<Arc<DataNode>>,
    format: WaveFormat,
}

impl Cursor {
    fn new(format: WaveFormat) -> Self {
        Self {
            curr: None,
            offset: 0,
            last: None,
            format,
        }
    }

    fn reset(&mut self) {
        self.curr = None;
        self.offset = 0;
        self.last = None;
    }
}

/// 流式音频源
///
/// 所有方法都只需要 `&self`，可以放进 `Arc` 由追加线程和播放线程共享
pub struct StreamingSource {
    config: SourceConfig,
    shared: Arc<Shared>,
    cursor: Mutex<Cursor>,
    /// `add` 的同步转换器
    inline: Mutex<Option<Conversion>>,
    worker: Mutex<Option<Worker>>,
}

/// 加锁；锁中毒时继续使用内部数据（所有修改都是单步完成的）
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamingSource {
    /// 创建输出为 `out_format` 的音频源。转换线程在第一次 `add_async` 时启动
    pub fn new(out_format: WaveFormat, config: SourceConfig) -> Result<Self, SourceError> {
        let out_format = WaveFormat::new(out_format.sample_rate, out_format.channels, out_format.bits_per_sample)?;
        let config = SourceConfig {
            node_blocks: config.node_blocks.max(1),
            ..config
        };

        Ok(Self {
            config,
            shared: Arc::new(Shared {
                chain: Mutex::new(Chain::new(out_format)),
                running: AtomicBool::new(false),
                stats: SourceStats::new(),
                config: config.converter,
            }),
            cursor: Mutex::new(Cursor::new(out_format)),
            inline: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    #[inline]
    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// 当前目标格式
    pub fn format(&self) -> WaveFormat {
        lock(&self.cursor).format
    }

    #[inline]
    pub fn stats(&self) -> &SourceStats {
        &self.shared.stats
    }

    /// 同步追加：在调用线程上转换后再链接
    ///
    /// 适合短小的输入。转换期间目标格式被 `reset_format` 改掉时，
    /// 节点以未转换状态链接，交给转换线程处理
    pub fn add(&self, data: &[u8], blocks: usize, format: WaveFormat) -> Result<(), SourceError> {
        let format = validate(data, blocks, format)?;
        if blocks == 0 {
            return Ok(());
        }

        let (out_format, generation) = {
            let chain = lock(&self.shared.chain);
            (chain.format, chain.generation)
        };
        // 不可表示的比例在链接前报告
        plan_rates(format.sample_rate, out_format.sample_rate)?;

        let nodes = split(data, blocks, format, self.config.node_blocks);
        let converted: Vec<(Vec<u8>, usize)> = {
            let mut inline = lock(&self.inline);
            nodes
                .iter()
                .map(|node| {
                    convert_node(
                        &mut inline,
                        node,
                        out_format,
                        generation,
                        self.config.converter,
                        &self.shared.stats,
                    )
                })
                .collect()
        };

        let wake = {
            let mut chain = lock(&self.shared.chain);
            if chain.generation == generation {
                for (node, (bytes, n)) in nodes.iter().zip(converted) {
                    node.publish(bytes, n);
                    self.shared.stats.record_node_converted();
                }
            } else {
                debug!("Target format changed during inline conversion, deferring to worker");
            }
            chain.append(nodes)
        };

        if wake {
            self.wake_worker()?;
        }
        Ok(())
    }

    /// 异步追加：切块链接后唤醒转换线程，立即返回
    pub fn add_async(&self, data: &[u8], blocks: usize, format: WaveFormat) -> Result<(), SourceError> {
        let format = validate(data, blocks, format)?;
        if blocks == 0 {
            return Ok(());
        }

        let nodes = split(data, blocks, format, self.config.node_blocks);
        let wake = {
            let mut chain = lock(&self.shared.chain);
            plan_rates(format.sample_rate, chain.format.sample_rate)?;
            chain.append(nodes)
        };

        if wake {
            self.wake_worker()?;
        }
        Ok(())
    }

    /// 读取 `blocks` 块（目标格式）到 `buffer`
    ///
    /// 实时路径：不等待转换。遇到未转换的节点或数据耗尽时，
    /// 剩余部分填充静音。返回实际复制的块数
    pub fn take(&self, buffer: &mut [u8], blocks: usize) -> usize {
        let mut cursor = lock(&self.cursor);
        let format = cursor.format;
        let block = format.block_size();
        let blocks = blocks.min(buffer.len() / block);

        let mut done = 0;
        let mut underrun = false;
        // 防止整圈都是空节点时无限循环
        let mut lap_progress = true;

        while done < blocks {
            let node = match cursor.curr.clone() {
                Some(node) => node,
                None => match self.resume(&mut cursor) {
                    Some(node) => node,
                    None => break,
                },
            };

            let Some(converted) = node.converted() else {
                underrun = true;
                break;
            };

            let available = converted.blocks.saturating_sub(cursor.offset);
            if available > 0 {
                let n = available.min(blocks - done);
                let from = cursor.offset * block;
                buffer[done * block..(done + n) * block].copy_from_slice(&converted.bytes[from..from + n * block]);
                cursor.offset += n;
                done += n;
                lap_progress = true;
                continue;
            }

            match node.next().cloned() {
                Some(next) => {
                    cursor.curr = Some(next);
                    cursor.offset = 0;
                }
                None if self.config.looped => {
                    if !lap_progress {
                        break;
                    }
                    lap_progress = false;
                    cursor.curr = lock(&self.shared.chain).head.clone();
                    cursor.offset = 0;
                }
                None => {
                    cursor.curr = None;
                    cursor.offset = 0;
                    cursor.last = Some(node);
                }
            }
        }

        format.fill_silence(&mut buffer[done * block..blocks * block]);

        if self.trims() {
            if let Ok(mut chain) = self.shared.chain.try_lock() {
                if let Some(keep) = cursor.curr.as_ref().or(cursor.last.as_ref()) {
                    chain.trim_to(keep);
                }
            }
        }

        let stats = &self.shared.stats;
        stats.record_take(done, blocks - done);
        if underrun {
            stats.record_underrun();
        }
        done
    }

    /// 删除播放位置之前的节点
    pub fn remove(&self) {
        let cursor = lock(&self.cursor);
        let mut chain = lock(&self.shared.chain);
        if let Some(keep) = cursor.curr.as_ref().or(cursor.last.as_ref()) {
            chain.trim_to(keep);
        }
    }

    /// 回到链头重新播放
    ///
    /// 未开启 `buffered` 时已播放的节点可能已被裁剪，只能回到仍保留的最早节点
    pub fn rewind(&self) {
        let mut cursor = lock(&self.cursor);
        let chain = lock(&self.shared.chain);
        cursor.curr = chain.head.clone();
        cursor.offset = 0;
        cursor.last = None;
    }

    /// 停止转换线程，释放整条链，重置游标
    pub fn clear(&self) {
        self.stop_worker();

        let mut cursor = lock(&self.cursor);
        lock(&self.shared.chain).clear();
        cursor.reset();
        *lock(&self.inline) = None;
    }

    /// 更换目标格式
    ///
    /// 所有节点从保留的原始数据重建并重新转换，播放位置映射到对应的新节点，
    /// 块偏移按采样率比例缩放。任何输入格式无法转换到新格式时返回错误，状态不变
    pub fn reset_format(&self, out_format: WaveFormat) -> Result<(), SourceError> {
        let out_format = WaveFormat::new(out_format.sample_rate, out_format.channels, out_format.bits_per_sample)?;

        let wake = {
            let mut cursor = lock(&self.cursor);
            let mut chain = lock(&self.shared.chain);
            if chain.format == out_format {
                return Ok(());
            }

            let mut rates: Vec<u32> = chain.iter().map(|node| node.format().sample_rate).collect();
            rates.sort_unstable();
            rates.dedup();
            for rate in rates {
                plan_rates(rate, out_format.sample_rate)?;
            }

            if self.trims() {
                if let Some(keep) = cursor.curr.as_ref().or(cursor.last.as_ref()) {
                    chain.trim_to(keep);
                }
            }

            let old_rate = chain.format.sample_rate;
            let Cursor { curr, last, .. } = &mut *cursor;
            chain.rebuild(out_format, &mut [curr, last]);

            cursor.offset = (cursor.offset as u64 * out_format.sample_rate as u64 / old_rate as u64) as usize;
            cursor.format = out_format;

            info!("Source re-targeted to {} ({} node(s))", out_format, chain.len());
            chain.proc.is_some()
        };

        *lock(&self.inline) = None;
        if wake {
            self.wake_worker()?;
        }
        Ok(())
    }

    /// 播放游标已经没有可读的数据
    pub fn is_exhausted(&self) -> bool {
        let cursor = lock(&self.cursor);
        match (&cursor.curr, &cursor.last) {
            (Some(node), _) => {
                !self.config.looped
                    && node.next().is_none()
                    && node
                        .converted()
                        .is_some_and(|c| cursor.offset >= c.blocks)
            }
            (None, Some(last)) => last.next().is_none(),
            (None, None) => lock(&self.shared.chain).head.is_none(),
        }
    }

    /// 没有待转换的节点
    pub fn is_idle(&self) -> bool {
        lock(&self.shared.chain).proc.is_none()
    }

    /// 可以被回收：播放完毕、转换空闲、未设置保留或循环
    pub fn is_reclaimable(&self) -> bool {
        !self.config.persist_when_empty && !self.config.looped && self.is_exhausted() && self.is_idle()
    }

    /// 链上的节点数
    pub fn node_count(&self) -> usize {
        lock(&self.shared.chain).len()
    }

    /// 是否在 take 时裁剪已播放的节点（循环播放需要保留整条链）
    #[inline]
    fn trims(&self) -> bool {
        !self.config.buffered && !self.config.looped
    }

    /// 游标为空时找下一个可读节点：
    /// 停在链尾的等待后继，新游标从链头开始
    fn resume(&self, cursor: &mut Cursor) -> Option<Arc<DataNode>> {
        let next = match &cursor.last {
            Some(last) => last.next().cloned()?,
            None => lock(&self.shared.chain).head.clone()?,
        };
        cursor.last = None;
        cursor.curr = Some(Arc::clone(&next));
        cursor.offset = 0;
        Some(next)
    }

    fn wake_worker(&self) -> Result<(), SourceError> {
        let mut worker = lock(&self.worker);
        match worker.as_ref() {
            Some(w) => w.wake(),
            None => {
                let spawned = Worker::spawn(Arc::clone(&self.shared)).map_err(SourceError::WorkerSpawn)?;
                debug!("Source worker spawned");
                *worker = Some(spawned);
            }
        }
        Ok(())
    }

    fn stop_worker(&self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.stop(&self.shared);
        }
    }
}

impl Drop for StreamingSource {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn validate(data: &[u8], blocks: usize, format: WaveFormat) -> Result<WaveFormat, SourceError> {
    let format = WaveFormat::new(format.sample_rate, format.channels, format.bits_per_sample)?;
    let Some(expected) = blocks.checked_mul(format.block_size()) else {
        return Err(SourceError::ShortInput {
            expected: usize::MAX,
            actual: data.len(),
        });
    };
    if data.len() < expected {
        return Err(SourceError::ShortInput {
            expected,
            actual: data.len(),
        });
    }
    Ok(format)
}
