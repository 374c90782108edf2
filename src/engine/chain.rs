//! 数据节点链
//!
//! 只追加的单向链表。节点的转换结果和后继指针都通过 `OnceLock` 一次性发布：
//! 写入完成后才对读者可见，之后不再修改，播放侧沿链读取不需要加锁。
//! 结构性修改（追加、裁剪头部、重建）由 `Chain` 外层的 Mutex 保护

use std::sync::{Arc, OnceLock};

use crate::audio::WaveFormat;

/// 转换后的数据（目标格式）
#[derive(Debug)]
pub(crate) struct Converted {
    pub bytes: Box<[u8]>,
    pub blocks: usize,
}

/// 一段音频：原始数据（自身格式）+ 转换结果（目标格式）
#[derive(Debug)]
pub(crate) struct DataNode {
    format: WaveFormat,
    origin: Arc<[u8]>,
    blocks: usize,
    processed: OnceLock<Converted>,
    next: OnceLock<Arc<DataNode>>,
}

impl DataNode {
    pub fn new(format: WaveFormat, origin: Arc<[u8]>, blocks: usize) -> Self {
        Self {
            format,
            origin,
            blocks,
            processed: OnceLock::new(),
            next: OnceLock::new(),
        }
    }

    /// 用同样的原始数据创建一个未转换的副本（目标格式改变时重建链）
    pub fn rebuild(&self) -> Self {
        Self::new(self.format, Arc::clone(&self.origin), self.blocks)
    }

    #[inline]
    pub fn format(&self) -> WaveFormat {
        self.format
    }

    #[inline]
    pub fn origin(&self) -> &[u8] {
        &self.origin
    }

    #[inline]
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    #[inline]
    pub fn converted(&self) -> Option<&Converted> {
        self.processed.get()
    }

    #[inline]
    pub fn is_processed(&self) -> bool {
        self.processed.get().is_some()
    }

    /// 发布转换结果；已发布过则忽略并返回 false
    pub fn publish(&self, bytes: Vec<u8>, blocks: usize) -> bool {
        self.processed
            .set(Converted {
                bytes: bytes.into_boxed_slice(),
                blocks,
            })
            .is_ok()
    }

    #[inline]
    pub fn next(&self) -> Option<&Arc<DataNode>> {
        self.next.get()
    }

    fn link(&self, next: Arc<DataNode>) -> bool {
        self.next.set(next).is_ok()
    }
}

impl Drop for DataNode {
    // 长链逐个释放，避免递归 drop 爆栈
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.take(),
                Err(_) => break,
            }
        }
    }
}

/// 把输入切成不超过 `node_blocks` 块的节点
pub(crate) fn split(data: &[u8], blocks: usize, format: WaveFormat, node_blocks: usize) -> Vec<Arc<DataNode>> {
    let block_size = format.block_size();
    data[..blocks * block_size]
        .chunks(node_blocks.max(1) * block_size)
        .map(|chunk| Arc::new(DataNode::new(format, Arc::from(chunk), chunk.len() / block_size)))
        .collect()
}

/// 链的结构状态
pub(crate) struct Chain {
    pub head: Option<Arc<DataNode>>,
    pub tail: Option<Arc<DataNode>>,
    /// 下一个待转换节点；None 表示 head 之后全部已转换
    pub proc: Option<Arc<DataNode>>,
    /// 目标格式
    pub format: WaveFormat,
    /// 每次重建或清空时递增，用来识别过期的转换任务
    pub generation: u64,
}

impl Chain {
    pub fn new(format: WaveFormat) -> Self {
        Self {
            head: None,
            tail: None,
            proc: None,
            format,
            generation: 0,
        }
    }

    /// 追加节点
    ///
    /// 未转换的节点会成为 `proc`（如果之前没有待转换节点）。
    /// 返回 true 表示转换线程需要唤醒
    pub fn append(&mut self, nodes: Vec<Arc<DataNode>>) -> bool {
        let mut wake = false;
        for node in nodes {
            match &self.tail {
                Some(tail) => {
                    tail.link(Arc::clone(&node));
                }
                None => self.head = Some(Arc::clone(&node)),
            }
            if self.proc.is_none() && !node.is_processed() {
                self.proc = Some(Arc::clone(&node));
                wake = true;
            }
            self.tail = Some(node);
        }
        wake
    }

    /// 删除 `keep` 之前的所有节点
    ///
    /// `keep` 不在链上时不做任何事。`proc` 随头部前移
    pub fn trim_to(&mut self, keep: &Arc<DataNode>) {
        if !self.iter().any(|node| Arc::ptr_eq(&node, keep)) {
            return;
        }
        while let Some(head) = self.head.take() {
            if Arc::ptr_eq(&head, keep) {
                self.head = Some(head);
                break;
            }
            if self.proc.as_ref().is_some_and(|p| Arc::ptr_eq(p, &head)) {
                self.proc = head.next().cloned();
            }
            self.head = head.next().cloned();
        }
    }

    /// 用未转换的副本替换整条链
    ///
    /// `track` 中的节点会被映射到对应的新节点
    pub fn rebuild(&mut self, format: WaveFormat, track: &mut [&mut Option<Arc<DataNode>>]) {
        let old: Vec<Arc<DataNode>> = self.iter().collect();
        let fresh: Vec<Arc<DataNode>> = old.iter().map(|node| Arc::new(node.rebuild())).collect();

        for slot in track.iter_mut() {
            let target = (**slot).take();
            **slot = target.and_then(|target| {
                old.iter()
                    .position(|node| Arc::ptr_eq(node, &target))
                    .map(|i| Arc::clone(&fresh[i]))
            });
        }

        self.clear();
        self.format = format;
        self.append(fresh);
    }

    /// 释放整条链
    pub fn clear(&mut self) {
        self.head = None;
        self.tail = None;
        self.proc = None;
        self.generation += 1;
    }

    pub fn iter(&self) -> ChainIter {
        ChainIter {
            next: self.head.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

pub(crate) struct ChainIter {
    next: Option<Arc<DataNode>>,
}

impl Iterator for ChainIter {
    type Item = Arc<DataNode>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next.take()?;
        self.next = node.next().cloned();
        Some(node)
    }
}
