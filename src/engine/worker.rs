//! 后台转换线程
//!
//! 每个音频源一个专用线程。循环：加锁取出 `proc`，解锁后转换，
//! 发布结果，再加锁推进 `proc`。没有待转换节点时 park，
//! 每次追加和停止都会 unpark（先 unpark 后 park 不会丢失唤醒）
//!
//! 线程内不向外传播错误：转换失败的节点发布为等长静音

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_utils::sync::{Parker, Unparker};
use log::{debug, warn};

use super::chain::{Chain, DataNode};
use super::{lock, Shared};
use crate::audio::{SourceStats, WaveFormat};
use crate::resample::{ConverterConfig, FormatConverter, ResampleError};

/// 转换器及其所属的链代次
pub(crate) struct Conversion {
    converter: FormatConverter,
    generation: u64,
}

/// 取出（必要时重建）匹配 (输入格式, 目标格式, 代次) 的转换器
///
/// 同一代次内输入格式改变会记录一次格式切换：转换链重建，延迟线历史丢失
pub(crate) fn prepare<'a>(
    slot: &'a mut Option<Conversion>,
    in_format: WaveFormat,
    out_format: WaveFormat,
    generation: u64,
    config: ConverterConfig,
    stats: &SourceStats,
) -> Result<&'a mut FormatConverter, ResampleError> {
    let conversion = match slot.take() {
        Some(c)
            if c.generation == generation
                && c.converter.in_format() == in_format
                && c.converter.out_format() == out_format =>
        {
            slot.insert(c)
        }
        previous => {
            if let Some(prev) = previous.filter(|p| p.generation == generation) {
                debug!(
                    "Input format changed {} -> {}, rebuilding converter",
                    prev.converter.in_format(),
                    in_format
                );
                stats.record_format_change();
            }
            let converter = FormatConverter::new(in_format, out_format, config)?;
            slot.insert(Conversion {
                converter,
                generation,
            })
        }
    };
    Ok(&mut conversion.converter)
}

/// 转换一个节点；失败时返回等长静音
pub(crate) fn convert_node(
    slot: &mut Option<Conversion>,
    node: &DataNode,
    out_format: WaveFormat,
    generation: u64,
    config: ConverterConfig,
    stats: &SourceStats,
) -> (Vec<u8>, usize) {
    match prepare(slot, node.format(), out_format, generation, config, stats) {
        Ok(converter) => converter.convert(node.origin(), node.blocks()),
        Err(e) => {
            warn!(
                "Conversion {} -> {} failed ({}), substituting silence",
                node.format(),
                out_format,
                e
            );
            stats.record_conversion_failure();
            let blocks = (node.blocks() as u64 * out_format.sample_rate as u64
                / node.format().sample_rate as u64) as usize;
            (vec![out_format.silence_byte(); blocks * out_format.block_size()], blocks)
        }
    }
}

struct Job {
    node: Arc<DataNode>,
    out_format: WaveFormat,
    generation: u64,
}

/// 跳过已转换的节点，返回下一个任务
fn next_job(chain: &mut Chain) -> Option<Job> {
    while let Some(node) = chain.proc.clone() {
        if !node.is_processed() {
            return Some(Job {
                node,
                out_format: chain.format,
                generation: chain.generation,
            });
        }
        chain.proc = node.next().cloned();
    }
    None
}

/// 转换线程句柄
pub(crate) struct Worker {
    handle: JoinHandle<()>,
    unparker: Unparker,
}

impl Worker {
    pub fn spawn(shared: Arc<Shared>) -> io::Result<Self> {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();

        shared.running.store(true, Ordering::Release);
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("source-worker".to_string())
            .spawn(move || run(thread_shared, parker))
            .inspect_err(|_| shared.running.store(false, Ordering::Release))?;

        Ok(Self { handle, unparker })
    }

    #[inline]
    pub fn wake(&self) {
        self.unparker.unpark();
    }

    /// 停止并等待线程退出；正在转换的节点会先完成
    pub fn stop(self, shared: &Shared) {
        shared.running.store(false, Ordering::Release);
        self.unparker.unpark();
        if self.handle.join().is_err() {
            warn!("Source worker panicked");
        }
    }
}

fn run(shared: Arc<Shared>, parker: Parker) {
    debug!("Source worker started");
    let mut slot: Option<Conversion> = None;

    while shared.running.load(Ordering::Acquire) {
        let job = next_job(&mut lock(&shared.chain));
        let Some(job) = job else {
            parker.park();
            continue;
        };

        let (bytes, blocks) = convert_node(
            &mut slot,
            &job.node,
            job.out_format,
            job.generation,
            shared.config,
            &shared.stats,
        );
        if job.node.publish(bytes, blocks) {
            shared.stats.record_node_converted();
        }

        // 链在转换期间可能已被重建或清空，只推进仍指向本节点的 proc
        let mut chain = lock(&shared.chain);
        if chain
            .proc
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, &job.node))
        {
            chain.proc = job.node.next().cloned();
        }
    }

    debug!("Source worker finished");
}
