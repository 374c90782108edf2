//! 音频格式和样本编解码
//!
//! 内部表示：所有样本统一解码为以 0 为中心的 i32，保持原位深的数值范围
//! - 8-bit: 无符号字节 v → v - 128，范围 [-128, 127]
//! - 16-bit: 有符号小端 → 原值，范围 [-32768, 32767]
//!
//! 位深转换使用固定的仿射映射（bit-exact）：
//! - 8 → 16: (v - 128) << 8
//! - 16 → 8: (s >> 8) + 128

use thiserror::Error;

/// 格式错误
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    #[error("unsupported channel count: {0} (expected 1 or 2)")]
    UnsupportedChannels(u16),
    #[error("unsupported bit depth: {0} (expected 8 or 16)")]
    UnsupportedBitDepth(u16),
    #[error("sample rate must be positive")]
    ZeroSampleRate,
}

/// PCM 波形格式
///
/// 只比较声道数、位深、采样率；块大小和字节率由这三者导出
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WaveFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl WaveFormat {
    /// 创建并校验格式（1-2 声道，8/16 bit，采样率 > 0）
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Result<Self, FormatError> {
        if !(1..=2).contains(&channels) {
            return Err(FormatError::UnsupportedChannels(channels));
        }
        if bits_per_sample != 8 && bits_per_sample != 16 {
            return Err(FormatError::UnsupportedBitDepth(bits_per_sample));
        }
        if sample_rate == 0 {
            return Err(FormatError::ZeroSampleRate);
        }
        Ok(Self {
            sample_rate,
            channels,
            bits_per_sample,
        })
    }

    /// 每块（帧）的样本数（= 声道数）
    #[inline]
    pub fn samples_per_block(&self) -> usize {
        self.channels as usize
    }

    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    /// 每块的字节数（block align）
    #[inline]
    pub fn block_size(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// 每秒字节数
    #[inline]
    pub fn byte_rate(&self) -> usize {
        self.block_size() * self.sample_rate as usize
    }

    /// 静音对应的字节值（8-bit 无符号以 0x80 为零点）
    #[inline]
    pub fn silence_byte(&self) -> u8 {
        if self.bits_per_sample == 8 {
            0x80
        } else {
            0x00
        }
    }

    /// 中心化样本的取值范围
    #[inline]
    pub fn sample_range(&self) -> (i32, i32) {
        match self.bits_per_sample {
            8 => (-128, 127),
            _ => (i16::MIN as i32, i16::MAX as i32),
        }
    }

    /// 将原始字节解码为中心化 i32 样本
    ///
    /// 返回解码的样本数
    pub fn decode_samples(&self, bytes: &[u8], output: &mut [i32]) -> usize {
        match self.bits_per_sample {
            8 => {
                let count = bytes.len().min(output.len());
                for (out, &b) in output.iter_mut().zip(&bytes[..count]) {
                    *out = b as i32 - 128;
                }
                count
            }
            16 => {
                let count = (bytes.len() / 2).min(output.len());
                for (out, chunk) in output.iter_mut().zip(bytes.chunks_exact(2)).take(count) {
                    // little-endian 16-bit signed
                    *out = i16::from_le_bytes([chunk[0], chunk[1]]) as i32;
                }
                count
            }
            _ => 0,
        }
    }

    /// 将中心化 i32 样本打包为字节并追加到 output
    ///
    /// 超出位深范围的值被钳位（FIR 过冲）
    pub fn encode_samples(&self, samples: &[i32], output: &mut Vec<u8>) {
        let (lo, hi) = self.sample_range();
        match self.bits_per_sample {
            8 => {
                output.extend(samples.iter().map(|&s| (s.clamp(lo, hi) + 128) as u8));
            }
            16 => {
                output.reserve(samples.len() * 2);
                for &s in samples {
                    output.extend_from_slice(&(s.clamp(lo, hi) as i16).to_le_bytes());
                }
            }
            _ => {}
        }
    }

    /// 用静音填充字节缓冲区
    #[inline]
    pub fn fill_silence(&self, bytes: &mut [u8]) {
        bytes.fill(self.silence_byte());
    }
}

impl std::fmt::Display for WaveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}-bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

/// 声道重映射（交错格式）
///
/// - 相同声道数：直接复制
/// - 单声道 → 立体声：复制到左右声道
/// - 立体声 → 单声道：左右取平均（算术右移）
///
/// 返回写入的样本数
pub fn remap_channels(src: &[i32], src_channels: usize, dst: &mut [i32], dst_channels: usize, blocks: usize) -> usize {
    match (src_channels, dst_channels) {
        (1, 2) => {
            for (i, &s) in src[..blocks].iter().enumerate() {
                dst[i * 2] = s;
                dst[i * 2 + 1] = s;
            }
            blocks * 2
        }
        (2, 1) => {
            for (i, pair) in src[..blocks * 2].chunks_exact(2).enumerate() {
                dst[i] = (pair[0] + pair[1]) >> 1;
            }
            blocks
        }
        _ => {
            let count = blocks * src_channels;
            dst[..count].copy_from_slice(&src[..count]);
            count
        }
    }
}

/// 位深重映射（原地，中心化样本）
pub fn remap_depth(samples: &mut [i32], from_bits: u16, to_bits: u16) {
    match (from_bits, to_bits) {
        (8, 16) => samples.iter_mut().for_each(|s| *s <<= 8),
        (16, 8) => samples.iter_mut().for_each(|s| *s >>= 8),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_validation() {
        assert!(WaveFormat::new(44100, 2, 16).is_ok());
        assert_eq!(
            WaveFormat::new(44100, 3, 16),
            Err(FormatError::UnsupportedChannels(3))
        );
        assert_eq!(
            WaveFormat::new(44100, 1, 24),
            Err(FormatError::UnsupportedBitDepth(24))
        );
        assert_eq!(WaveFormat::new(0, 1, 8), Err(FormatError::ZeroSampleRate));
    }

    #[test]
    fn test_derived_sizes() {
        let format = WaveFormat::new(44100, 2, 16).unwrap();
        assert_eq!(format.block_size(), 4);
        assert_eq!(format.byte_rate(), 176400);

        let format = WaveFormat::new(11025, 1, 8).unwrap();
        assert_eq!(format.block_size(), 1);
        assert_eq!(format.byte_rate(), 11025);
        assert_eq!(format.silence_byte(), 0x80);
    }

    #[test]
    fn test_16bit_roundtrip() {
        let format = WaveFormat::new(48000, 1, 16).unwrap();

        let input_bytes = [0x00, 0x40, 0x00, 0xC0]; // +16384, -16384
        let mut samples = [0i32; 2];
        assert_eq!(format.decode_samples(&input_bytes, &mut samples), 2);
        assert_eq!(samples, [16384, -16384]);

        let mut output_bytes = Vec::new();
        format.encode_samples(&samples, &mut output_bytes);
        assert_eq!(output_bytes, input_bytes);
    }

    #[test]
    fn test_8bit_centered() {
        let format = WaveFormat::new(8000, 1, 8).unwrap();
        let mut samples = [0i32; 3];
        format.decode_samples(&[0, 128, 255], &mut samples);
        assert_eq!(samples, [-128, 0, 127]);

        let mut bytes = Vec::new();
        format.encode_samples(&samples, &mut bytes);
        assert_eq!(bytes, [0, 128, 255]);
    }

    #[test]
    fn test_encode_clamps_overshoot() {
        let format = WaveFormat::new(48000, 1, 16).unwrap();
        let mut bytes = Vec::new();
        format.encode_samples(&[40000, -40000], &mut bytes);
        assert_eq!(bytes, [0xFF, 0x7F, 0x00, 0x80]);
    }

    #[test]
    fn test_depth_affine_mapping() {
        // 无符号 v → (v - 128) << 8，反向 (s >> 8) + 128
        let format8 = WaveFormat::new(8000, 1, 8).unwrap();
        for v in 0..=255u8 {
            let mut s = [0i32; 1];
            format8.decode_samples(&[v], &mut s);
            remap_depth(&mut s, 8, 16);
            assert_eq!(s[0], (v as i32 - 128) << 8);

            remap_depth(&mut s, 16, 8);
            let mut back = Vec::new();
            format8.encode_samples(&s, &mut back);
            assert_eq!(back, [v]);
        }
    }

    #[test]
    fn test_channel_roundtrip_constant() {
        let mono = [1234i32; 8];
        let mut stereo = [0i32; 16];
        assert_eq!(remap_channels(&mono, 1, &mut stereo, 2, 8), 16);
        assert!(stereo.iter().all(|&s| s == 1234));

        let mut back = [0i32; 8];
        assert_eq!(remap_channels(&stereo, 2, &mut back, 1, 8), 8);
        assert_eq!(back, mono);
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let stereo = [100, 300, -100, -301];
        let mut mono = [0i32; 2];
        remap_channels(&stereo, 2, &mut mono, 1, 2);
        assert_eq!(mono, [200, -201]);
    }
}
