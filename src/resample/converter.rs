//! 格式转换器
//!
//! 固定顺序：声道重映射 → 位深重映射 → 采样率分级转换。
//! 声道和位深只在输入分辨率上处理一次，采样率转换总在最后，
//! 滤波器只依赖输出的声道/位深
//!
//! 中间缓冲区在构建时按 `max_blocks` 和各级 L/M 一次性分配，之后复用

use log::info;

use super::polyphase::PolyphaseConverter;
use super::ratio::{plan_rates, ScalingStage};
use super::{ConverterConfig, ResampleError};
use crate::audio::format::{remap_channels, remap_depth};
use crate::audio::WaveFormat;

pub struct FormatConverter {
    in_format: WaveFormat,
    out_format: WaveFormat,
    config: ConverterConfig,
    stages: Vec<PolyphaseConverter>,
    /// 解码后的输入样本（输入声道数）
    decoded: Vec<i32>,
    /// buffers[0]: 重映射后；buffers[s + 1]: 第 s 级输出
    buffers: Vec<Vec<i32>>,
}

impl FormatConverter {
    /// 构建转换器
    ///
    /// 采样率对无法用质数表分解时返回 `UnrepresentableRatio`
    pub fn new(in_format: WaveFormat, out_format: WaveFormat, config: ConverterConfig) -> Result<Self, ResampleError> {
        // 字段是公开的，重新校验一次
        let in_format = WaveFormat::new(in_format.sample_rate, in_format.channels, in_format.bits_per_sample)?;
        let out_format = WaveFormat::new(out_format.sample_rate, out_format.channels, out_format.bits_per_sample)?;

        let config = ConverterConfig {
            taps_per_phase: config.taps_per_phase.max(1),
            max_blocks: config.max_blocks.max(1),
        };

        let plan = plan_rates(in_format.sample_rate, out_format.sample_rate)?;
        let channels = out_format.channels as usize;

        let stages = plan
            .iter()
            .map(|&stage| PolyphaseConverter::new(stage, channels, &config))
            .collect::<Result<Vec<_>, _>>()?;

        let mut buffers = Vec::with_capacity(stages.len() + 1);
        let mut capacity = config.max_blocks;
        buffers.push(vec![0; capacity * channels]);
        for stage in &plan {
            capacity = stage.max_output(capacity);
            buffers.push(vec![0; capacity * channels]);
        }

        if in_format != out_format {
            info!(
                "Converter {} -> {}: {} stage(s) {:?}",
                in_format,
                out_format,
                plan.len(),
                plan.iter().map(|s| (s.l, s.m)).collect::<Vec<_>>()
            );
        }

        Ok(Self {
            in_format,
            out_format,
            config,
            stages,
            decoded: vec![0; config.max_blocks * in_format.channels as usize],
            buffers,
        })
    }

    #[inline]
    pub fn in_format(&self) -> WaveFormat {
        self.in_format
    }

    #[inline]
    pub fn out_format(&self) -> WaveFormat {
        self.out_format
    }

    #[inline]
    pub fn config(&self) -> ConverterConfig {
        self.config
    }

    /// 各级 (L, M)
    pub fn stages(&self) -> Vec<ScalingStage> {
        self.stages.iter().map(PolyphaseConverter::stage).collect()
    }

    /// 转换 `blocks` 个输入块
    ///
    /// 返回 (输出字节, 输出块数)。`src` 不足 `blocks` 块时只转换完整的部分。
    /// 状态跨调用保留，连续调用等价于一次转换整个流
    pub fn convert(&mut self, src: &[u8], blocks: usize) -> (Vec<u8>, usize) {
        let blocks = blocks.min(src.len() / self.in_format.block_size());

        if self.in_format == self.out_format {
            let len = blocks * self.in_format.block_size();
            return (src[..len].to_vec(), blocks);
        }

        let in_block = self.in_format.block_size();
        let out_channels = self.out_format.channels as usize;
        let mut output = Vec::with_capacity(self.estimate_output(blocks) * self.out_format.block_size());
        let mut total = 0;

        for chunk in src[..blocks * in_block].chunks(self.config.max_blocks * in_block) {
            let count = chunk.len() / in_block;
            let produced = self.convert_chunk(chunk, count);
            let last = &self.buffers[self.stages.len()];
            self.out_format.encode_samples(&last[..produced * out_channels], &mut output);
            total += produced;
        }

        (output, total)
    }

    /// 清空所有级的延迟线（显式流重置）
    pub fn reset(&mut self) {
        self.stages.iter_mut().for_each(PolyphaseConverter::reset);
    }

    /// 输出块数的上界
    pub fn estimate_output(&self, blocks: usize) -> usize {
        self.stages
            .iter()
            .fold(blocks, |n, conv| conv.stage().max_output(n))
    }

    fn convert_chunk(&mut self, chunk: &[u8], blocks: usize) -> usize {
        let in_channels = self.in_format.channels as usize;
        let out_channels = self.out_format.channels as usize;

        let decoded = &mut self.decoded[..blocks * in_channels];
        self.in_format.decode_samples(chunk, decoded);

        let written = remap_channels(decoded, in_channels, &mut self.buffers[0], out_channels, blocks);
        remap_depth(
            &mut self.buffers[0][..written],
            self.in_format.bits_per_sample,
            self.out_format.bits_per_sample,
        );

        let mut count = blocks;
        for (s, stage) in self.stages.iter_mut().enumerate() {
            let (done, rest) = self.buffers.split_at_mut(s + 1);
            let src = &done[s];
            let dst = &mut rest[0];

            let mut produced = 0;
            for channel in 0..out_channels {
                produced = stage.process(src, dst, channel, count);
            }
            count = produced;
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(rate: u32, channels: u16, bits: u16) -> WaveFormat {
        WaveFormat::new(rate, channels, bits).unwrap()
    }

    fn constant_16bit(value: i16, samples: usize) -> Vec<u8> {
        (0..samples).flat_map(|_| value.to_le_bytes()).collect()
    }

    fn samples_16bit(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_identity_returns_same_bytes() {
        let fmt = format(44100, 2, 16);
        let mut conv = FormatConverter::new(fmt, fmt, ConverterConfig::default()).unwrap();
        let src: Vec<u8> = (0..400).map(|i| (i * 37 % 256) as u8).collect();
        let (out, blocks) = conv.convert(&src, 100);
        assert_eq!(blocks, 100);
        assert_eq!(out, src);
        assert!(conv.stages().is_empty());
    }

    #[test]
    fn test_mono_stereo_mono_keeps_constant() {
        let mono = format(22050, 1, 16);
        let stereo = format(22050, 2, 16);
        let src = constant_16bit(-1234, 500);

        let mut up = FormatConverter::new(mono, stereo, ConverterConfig::default()).unwrap();
        let (mid, mid_blocks) = up.convert(&src, 500);
        assert_eq!(mid_blocks, 500);
        assert!(samples_16bit(&mid).iter().all(|&s| s == -1234));

        let mut down = FormatConverter::new(stereo, mono, ConverterConfig::default()).unwrap();
        let (back, blocks) = down.convert(&mid, mid_blocks);
        assert_eq!(blocks, 500);
        assert_eq!(back, src);
    }

    #[test]
    fn test_depth_round_trip() {
        let eight = format(8000, 1, 8);
        let sixteen = format(8000, 1, 16);
        let src: Vec<u8> = (0..=255).collect();

        let mut up = FormatConverter::new(eight, sixteen, ConverterConfig::default()).unwrap();
        let (wide, n) = up.convert(&src, src.len());
        assert_eq!(n, 256);
        assert_eq!(samples_16bit(&wide)[0], i16::MIN);
        assert_eq!(samples_16bit(&wide)[128], 0);

        let mut down = FormatConverter::new(sixteen, eight, ConverterConfig::default()).unwrap();
        let (narrow, n) = down.convert(&wide, n);
        assert_eq!(n, 256);
        assert_eq!(narrow, src);
    }

    #[test]
    fn test_44100_mono_to_48000_stereo() {
        let input = format(44100, 1, 16);
        let output = format(48000, 2, 16);
        let mut conv = FormatConverter::new(input, output, ConverterConfig::default()).unwrap();
        assert_eq!(
            conv.stages(),
            vec![
                ScalingStage::new(5, 3),
                ScalingStage::new(8, 7),
                ScalingStage::new(4, 7)
            ]
        );

        let src = constant_16bit(8000, 44100);
        let (out, blocks) = conv.convert(&src, 44100);
        assert_eq!(blocks, 48000);
        assert_eq!(out.len(), 48000 * 4);

        let samples = samples_16bit(&out);
        for pair in samples.chunks_exact(2) {
            assert_eq!(pair[0], pair[1]);
        }
        // 滤波器填满之后恒定输入得到恒定输出
        assert!(samples[samples.len() - 200..].iter().all(|&s| s == 8000));
    }

    #[test]
    fn test_chunked_calls_match_single_call() {
        let input = format(48000, 2, 16);
        let output = format(44100, 1, 8);
        let src: Vec<u8> = (0..4800 * 2)
            .flat_map(|i| ((((i * 131) % 4000) as i16 - 2000) * 8).to_le_bytes())
            .collect();

        let mut whole = FormatConverter::new(input, output, ConverterConfig::default()).unwrap();
        let (expected, expected_blocks) = whole.convert(&src, 4800);

        let small = ConverterConfig {
            max_blocks: 100,
            ..ConverterConfig::default()
        };
        let mut chunked = FormatConverter::new(input, output, small).unwrap();
        let mut got = Vec::new();
        let mut got_blocks = 0;
        for piece in src.chunks(4 * 333) {
            let (bytes, n) = chunked.convert(piece, piece.len() / 4);
            got.extend(bytes);
            got_blocks += n;
        }

        assert_eq!(got_blocks, expected_blocks);
        assert_eq!(got, expected);
    }

    #[test]
    fn test_short_source_converts_whole_blocks_only() {
        let fmt = format(16000, 2, 16);
        let mut conv = FormatConverter::new(fmt, format(16000, 1, 16), ConverterConfig::default()).unwrap();
        let (out, n) = conv.convert(&[0u8; 10], 5);
        assert_eq!(n, 2);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_unrepresentable_ratio() {
        let result = FormatConverter::new(format(44100, 1, 16), format(44056, 1, 16), ConverterConfig::default());
        assert!(matches!(
            result,
            Err(ResampleError::UnrepresentableRatio { value: 44056 })
        ));
    }
}
