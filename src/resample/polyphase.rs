//! 多相 FIR 采样率转换
//!
//! 每个缩放级 (L, M) 一个 `PolyphaseConverter`，按声道保存延迟线和相位计数。
//! 所有处理函数都可以续接：任意切块喂入，输出与一次性处理完全一致
//!
//! 样本为交错格式的中心化 i32，`channel` 选择声道，`blocks` 为输入块数

use super::filter::FirFilter;
use super::ratio::ScalingStage;
use super::{ConverterConfig, ResampleError};

/// 环形延迟线（单声道）
///
/// 写游标按容量取模前进；只在显式 reset 时清零
#[derive(Clone, Debug)]
pub struct DelayLine {
    samples: Box<[i32]>,
    cursor: usize,
}

impl DelayLine {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0; capacity.max(1)].into_boxed_slice(),
            cursor: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// 写入一个样本，覆盖最旧的样本
    #[inline]
    pub fn push(&mut self, sample: i32) {
        self.samples[self.cursor] = sample;
        self.cursor += 1;
        if self.cursor == self.samples.len() {
            self.cursor = 0;
        }
    }

    /// 往回第 `age` 个样本（0 = 最新）
    #[inline]
    pub fn newest(&self, age: usize) -> i32 {
        let cap = self.samples.len();
        self.samples[(self.cursor + cap - 1 - age % cap) % cap]
    }

    /// 与回文系数做对称卷积
    ///
    /// 从两端向中心成对相加再乘系数，乘法次数减半。
    /// 系数长度必须等于容量
    pub fn symmetric_convolve(&self, coefs: &[i64]) -> i64 {
        let cap = self.samples.len();
        debug_assert_eq!(coefs.len(), cap);

        // cursor 指向最旧样本
        let mut old = self.cursor;
        let mut new = if self.cursor == 0 { cap - 1 } else { self.cursor - 1 };
        let mut acc: i64 = 0;

        for &coef in &coefs[..cap / 2] {
            acc += coef * (self.samples[old] as i64 + self.samples[new] as i64);
            old = if old == cap - 1 { 0 } else { old + 1 };
            new = if new == 0 { cap - 1 } else { new - 1 };
        }

        // 奇数长度：中间样本单独计算
        if cap % 2 == 1 {
            acc += coefs[cap / 2] * self.samples[new] as i64;
        }

        acc
    }

    pub fn reset(&mut self) {
        self.samples.fill(0);
        self.cursor = 0;
    }
}

/// 插值侧：多相滤波器 + 每相增益 + 每声道延迟线和相位
#[derive(Clone, Debug)]
struct Interpolator {
    filter: FirFilter,
    phase_gains: Vec<i64>,
    taps_per_phase: usize,
    lines: Vec<DelayLine>,
    /// 融合路径下一个输出在当前输入内的上采样偏移
    phases: Vec<usize>,
}

impl Interpolator {
    fn new(l: usize, taps_per_phase: usize, cutoff_divisor: usize, channels: usize) -> Result<Self, ResampleError> {
        let filter = FirFilter::design(l * taps_per_phase, 1.0, (cutoff_divisor * 2) as f64)?;
        // 各相在非均匀的子样本偏移上取值，增益不等，分别归一化
        let phase_gains = (0..l)
            .map(|p| filter.phase_gain(l, p).max(1))
            .collect();

        Ok(Self {
            filter,
            phase_gains,
            taps_per_phase,
            lines: vec![DelayLine::new(taps_per_phase); channels],
            phases: vec![0; channels],
        })
    }

    /// 计算第 `phase` 相的一个输出
    #[inline]
    fn evaluate(&self, channel: usize, phase: usize, l: usize) -> i32 {
        let line = &self.lines[channel];
        let coefs = self.filter.coefs();
        let mut acc: i64 = 0;
        for k in 0..self.taps_per_phase {
            acc += coefs[phase + k * l] * line.newest(k) as i64;
        }
        (acc / self.phase_gains[phase]) as i32
    }

    fn reset(&mut self) {
        self.lines.iter_mut().for_each(DelayLine::reset);
        self.phases.fill(0);
    }
}

/// 抽取侧：回文滤波器 + 直流增益 + 每声道延迟线和抽取计数
#[derive(Clone, Debug)]
struct Decimator {
    filter: FirFilter,
    dc_gain: i64,
    lines: Vec<DelayLine>,
    fractions: Vec<usize>,
}

impl Decimator {
    fn new(m: usize, taps_per_phase: usize, channels: usize) -> Result<Self, ResampleError> {
        let taps = m * taps_per_phase + 1;
        let filter = FirFilter::design(taps, 1.0, (m * 2) as f64)?;
        let dc_gain = filter.dc_gain().max(1);

        Ok(Self {
            filter,
            dc_gain,
            lines: vec![DelayLine::new(taps); channels],
            fractions: vec![0; channels],
        })
    }

    fn reset(&mut self) {
        self.lines.iter_mut().for_each(DelayLine::reset);
        self.fractions.fill(0);
    }
}

/// 单级 (L, M) 多相转换器
#[derive(Clone, Debug)]
pub struct PolyphaseConverter {
    stage: ScalingStage,
    channels: usize,
    interp: Option<Interpolator>,
    decim: Option<Decimator>,
}

impl PolyphaseConverter {
    /// 为一个缩放级构建转换器
    ///
    /// - 纯插值 (L, 1)：插值滤波器截止在 1/(2L)
    /// - 纯抽取 (1, M)：抽取滤波器截止在 1/(2M)
    /// - 非整数 (L, M)：只用插值多相滤波器，截止取 1/(2·max(L, M))，
    ///   每相长度按 max(L, M)/L 加长以保持过渡带宽度
    pub fn new(stage: ScalingStage, channels: usize, config: &ConverterConfig) -> Result<Self, ResampleError> {
        let l = stage.l as usize;
        let m = stage.m as usize;
        let taps = config.taps_per_phase.max(1);

        let (interp, decim) = match (l > 1, m > 1) {
            (true, true) => {
                let widen = m.div_ceil(l).max(1);
                (Some(Interpolator::new(l, taps * widen, l.max(m), channels)?), None)
            }
            (true, false) => (Some(Interpolator::new(l, taps, l, channels)?), None),
            (false, true) => (None, Some(Decimator::new(m, taps, channels)?)),
            (false, false) => (None, None),
        };

        Ok(Self {
            stage,
            channels,
            interp,
            decim,
        })
    }

    #[inline]
    pub fn stage(&self) -> ScalingStage {
        self.stage
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// 按本级类型分派；返回写入的块数
    pub fn process(&mut self, src: &[i32], dst: &mut [i32], channel: usize, blocks: usize) -> usize {
        match (self.interp.is_some(), self.decim.is_some()) {
            (true, false) if self.stage.m > 1 => self.convert_non_integral(src, dst, channel, blocks),
            (true, false) => self.interpolate(src, dst, channel, blocks),
            (false, true) => self.decimate(src, dst, channel, blocks),
            _ => passthrough(src, dst, self.channels, channel, blocks),
        }
    }

    /// 抽取：每个输入样本推入延迟线，每推入 M 个输出一个样本
    ///
    /// 输出 = 对称卷积 / 直流增益。M = 1 时直通
    pub fn decimate(&mut self, src: &[i32], dst: &mut [i32], channel: usize, blocks: usize) -> usize {
        let m = self.stage.m as usize;
        let stride = self.channels;
        let Some(decim) = self.decim.as_mut() else {
            return passthrough(src, dst, stride, channel, blocks);
        };

        let mut written = 0;
        for i in 0..blocks {
            decim.lines[channel].push(src[i * stride + channel]);

            let fraction = &mut decim.fractions[channel];
            *fraction += 1;
            if *fraction == m {
                *fraction = 0;
                let acc = decim.lines[channel].symmetric_convolve(decim.filter.coefs());
                dst[written * stride + channel] = (acc / decim.dc_gain) as i32;
                written += 1;
            }
        }
        written
    }

    /// 插值：每个输入样本输出 L 个样本，每个来自一相（步长 L 的系数子集）
    ///
    /// L = 1 时直通
    pub fn interpolate(&mut self, src: &[i32], dst: &mut [i32], channel: usize, blocks: usize) -> usize {
        let l = self.stage.l as usize;
        let stride = self.channels;
        let Some(interp) = self.interp.as_mut() else {
            return passthrough(src, dst, stride, channel, blocks);
        };

        let mut written = 0;
        for i in 0..blocks {
            interp.lines[channel].push(src[i * stride + channel]);
            for phase in 0..l {
                dst[written * stride + channel] = interp.evaluate(channel, phase, l);
                written += 1;
            }
        }
        written
    }

    /// 非整数比例：插值与抽取融合
    ///
    /// 不生成完整的上采样序列，只计算抽取后保留的那些上采样点：
    /// 输出 j 对应上采样位置 j·M，相位为 (j·M) mod L。
    /// 每个输入样本之后，相位计数只推进到离开当前输入的 L 个槽位为止
    ///
    /// 这里有意不采用“插值滤波器 + 抽取滤波器 + 抽取延迟线”的两级布局：
    /// 截止为 1/(2·max(L, M)) 的单个插值滤波器同时承担抗镜像和抗混叠，
    /// 输出直接写入 `dst`，不经过抽取延迟线
    pub fn convert_non_integral(&mut self, src: &[i32], dst: &mut [i32], channel: usize, blocks: usize) -> usize {
        let l = self.stage.l as usize;
        let m = self.stage.m as usize;
        if l == 1 {
            return self.decimate(src, dst, channel, blocks);
        }
        if m == 1 {
            return self.interpolate(src, dst, channel, blocks);
        }

        let stride = self.channels;
        let Some(interp) = self.interp.as_mut() else {
            return passthrough(src, dst, stride, channel, blocks);
        };

        let mut written = 0;
        let mut phase = interp.phases[channel];
        for i in 0..blocks {
            interp.lines[channel].push(src[i * stride + channel]);
            while phase < l {
                dst[written * stride + channel] = interp.evaluate(channel, phase, l);
                written += 1;
                phase += m;
            }
            phase -= l;
        }
        interp.phases[channel] = phase;
        written
    }

    /// 清空所有延迟线和相位（显式流重置）
    pub fn reset(&mut self) {
        if let Some(interp) = self.interp.as_mut() {
            interp.reset();
        }
        if let Some(decim) = self.decim.as_mut() {
            decim.reset();
        }
    }
}

fn passthrough(src: &[i32], dst: &mut [i32], stride: usize, channel: usize, blocks: usize) -> usize {
    for i in 0..blocks {
        dst[i * stride + channel] = src[i * stride + channel];
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converter(l: u32, m: u32, channels: usize) -> PolyphaseConverter {
        PolyphaseConverter::new(ScalingStage::new(l, m), channels, &ConverterConfig::default()).unwrap()
    }

    /// 确定性的测试信号
    fn signal(len: usize) -> Vec<i32> {
        (0..len)
            .map(|i| (((i * 7919) % 2000) as i32 - 1000) * 10)
            .collect()
    }

    fn run(conv: &mut PolyphaseConverter, src: &[i32], channel: usize) -> Vec<i32> {
        let stage = conv.stage();
        let blocks = src.len() / conv.channels();
        let cap = stage.max_output(blocks) * conv.channels();
        let mut dst = vec![0; cap];
        let n = conv.process(src, &mut dst, channel, blocks);
        dst.truncate(n * conv.channels());
        dst
    }

    #[test]
    fn test_delay_line_wraps() {
        let mut line = DelayLine::new(3);
        for s in 1..=5 {
            line.push(s);
        }
        assert_eq!(line.newest(0), 5);
        assert_eq!(line.newest(1), 4);
        assert_eq!(line.newest(2), 3);
    }

    #[test]
    fn test_symmetric_convolve_matches_direct() {
        let coefs = [1i64, 2, 3, 2, 1];
        let mut line = DelayLine::new(5);
        for s in [10, 20, 30, 40, 50, 60, 70] {
            line.push(s);
        }
        // 时间顺序（旧→新）：30 40 50 60 70
        let direct: i64 = [30i64, 40, 50, 60, 70]
            .iter()
            .zip(coefs.iter())
            .map(|(s, c)| s * c)
            .sum();
        assert_eq!(line.symmetric_convolve(&coefs), direct);

        let even = [1i64, 3, 3, 1];
        let mut line = DelayLine::new(4);
        for s in [5, 6, 7, 8, 9] {
            line.push(s);
        }
        assert_eq!(line.symmetric_convolve(&even), 6 + 3 * 7 + 3 * 8 + 9);
    }

    #[test]
    fn test_decimate_m1_is_passthrough() {
        let mut conv = converter(1, 1, 1);
        let src = signal(100);
        let mut dst = vec![0; 100];
        assert_eq!(conv.decimate(&src, &mut dst, 0, 100), 100);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_interpolate_l1_is_passthrough() {
        let mut conv = converter(1, 3, 1);
        let src = signal(50);
        let mut dst = vec![0; 50];
        assert_eq!(conv.interpolate(&src, &mut dst, 0, 50), 50);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_output_counts() {
        let src = signal(300);
        assert_eq!(run(&mut converter(1, 3, 1), &src, 0).len(), 100);
        assert_eq!(run(&mut converter(4, 1, 1), &src, 0).len(), 1200);
        // ceil(300 * 5 / 3)
        assert_eq!(run(&mut converter(5, 3, 1), &src, 0).len(), 500);
        // ceil(300 * 4 / 7) = 172
        assert_eq!(run(&mut converter(4, 7, 1), &src, 0).len(), 172);
    }

    #[test]
    fn test_constant_settles_to_unity_gain() {
        for (l, m) in [(1u32, 3u32), (3, 1), (5, 3), (8, 7), (4, 7)] {
            let mut conv = converter(l, m, 1);
            let src = vec![1000; 2000];
            let out = run(&mut conv, &src, 0);
            // 前段为延迟线填充的过渡
            let tail = &out[out.len() - 10..];
            assert!(tail.iter().all(|&s| s == 1000), "({}, {}) tail = {:?}", l, m, tail);
        }
    }

    #[test]
    fn test_resumable_across_chunks() {
        for (l, m) in [(1u32, 4u32), (3, 1), (5, 3), (4, 7)] {
            let src = signal(997);

            let mut whole = converter(l, m, 1);
            let expected = run(&mut whole, &src, 0);

            let mut chunked = converter(l, m, 1);
            let mut got = Vec::new();
            let mut start = 0;
            for size in [1usize, 13, 64, 7, 300].iter().cycle() {
                if start >= src.len() {
                    break;
                }
                let end = (start + size).min(src.len());
                got.extend(run(&mut chunked, &src[start..end], 0));
                start = end;
            }

            assert_eq!(got, expected, "({}, {}) differs when chunked", l, m);
        }
    }

    #[test]
    fn test_channels_are_independent() {
        let mut conv = converter(5, 3, 2);
        let mono = signal(200);
        let mut stereo = vec![0; 400];
        for (i, &s) in mono.iter().enumerate() {
            stereo[i * 2] = s;
            stereo[i * 2 + 1] = -s;
        }
        let cap = ScalingStage::new(5, 3).max_output(200) * 2;
        let mut dst = vec![0; cap];
        let left = conv.process(&stereo, &mut dst, 0, 200);
        let right = conv.process(&stereo, &mut dst, 1, 200);
        assert_eq!(left, right);
        for i in 0..left {
            assert_eq!(dst[i * 2], -dst[i * 2 + 1]);
        }
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let src = signal(128);
        let mut conv = converter(8, 7, 1);
        let first = run(&mut conv, &src, 0);
        conv.reset();
        let second = run(&mut conv, &src, 0);
        assert_eq!(first, second);
    }
}
