//! 混音与刷新节拍
//!
//! 输出设备每个刷新周期（默认 10ms）从每个音频源 take 一段数据，
//! 再叠加混合到同一个输出缓冲区

use super::format::WaveFormat;

/// 每秒刷新次数（10ms 一次）
pub const DEFAULT_TICKS_PER_SECOND: u32 = 100;

/// 将 src 混合到 dst（两者均为 format 格式的交错字节）
///
/// 每个样本使用 `a + b - (a * b >> bits)`，结果钳位到位深范围。
/// 8-bit 样本先中心化再混合
pub fn mix_into(dst: &mut [u8], src: &[u8], format: &WaveFormat) {
    let len = dst.len().min(src.len());
    let (lo, hi) = format.sample_range();
    let bits = format.bits_per_sample as u32;

    match format.bits_per_sample {
        8 => {
            for (a, &b) in dst[..len].iter_mut().zip(&src[..len]) {
                let x = *a as i64 - 128;
                let y = b as i64 - 128;
                let mixed = blend(x, y, bits).clamp(lo as i64, hi as i64);
                *a = (mixed + 128) as u8;
            }
        }
        16 => {
            for (a, b) in dst[..len]
                .chunks_exact_mut(2)
                .zip(src[..len].chunks_exact(2))
            {
                let x = i16::from_le_bytes([a[0], a[1]]) as i64;
                let y = i16::from_le_bytes([b[0], b[1]]) as i64;
                let mixed = blend(x, y, bits).clamp(lo as i64, hi as i64) as i16;
                a.copy_from_slice(&mixed.to_le_bytes());
            }
        }
        _ => {}
    }
}

#[inline]
fn blend(a: i64, b: i64, bits: u32) -> i64 {
    a + b - ((a * b) >> bits)
}

/// 刷新节拍计算
///
/// 采样率不一定能被刷新频率整除（例如 44100 / 100 可以，22050 / 100 不行），
/// 用余数累加器保证长期总块数精确等于采样率
#[derive(Debug, Clone)]
pub struct RefillPacer {
    blocks_per_second: u32,
    ticks_per_second: u32,
    accumulator: u64,
}

impl RefillPacer {
    pub fn new(sample_rate: u32, ticks_per_second: u32) -> Self {
        Self {
            blocks_per_second: sample_rate,
            ticks_per_second: ticks_per_second.max(1),
            accumulator: 0,
        }
    }

    /// 下一个刷新周期需要的块数
    pub fn next_tick(&mut self) -> usize {
        self.accumulator += self.blocks_per_second as u64;
        let blocks = self.accumulator / self.ticks_per_second as u64;
        self.accumulator -= blocks * self.ticks_per_second as u64;
        blocks as usize
    }

    /// 单个周期的最大块数（用于预分配缓冲区）
    pub fn max_tick_blocks(&self) -> usize {
        self.blocks_per_second.div_ceil(self.ticks_per_second) as usize
    }

    /// 刷新周期长度
    pub fn tick_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(1) / self.ticks_per_second
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_with_silence_is_identity() {
        let format = WaveFormat::new(44100, 1, 16).unwrap();
        let mut dst = vec![0u8; 4];
        let src = [0x34, 0x12, 0xCC, 0xFF]; // 0x1234, -52
        mix_into(&mut dst, &src, &format);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_mix_8bit_silence_is_identity() {
        let format = WaveFormat::new(8000, 1, 8).unwrap();
        let mut dst = vec![0x80u8; 3];
        let src = [0x00, 0x90, 0xFF];
        mix_into(&mut dst, &src, &format);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_mix_blend_formula() {
        let format = WaveFormat::new(44100, 1, 16).unwrap();
        let mut dst = 16384i16.to_le_bytes().to_vec();
        let src = 16384i16.to_le_bytes();
        mix_into(&mut dst, &src, &format);
        // 16384 + 16384 - (16384 * 16384 >> 16) = 28672
        assert_eq!(i16::from_le_bytes([dst[0], dst[1]]), 28672);
    }

    #[test]
    fn test_pacer_exact_over_one_second() {
        let mut pacer = RefillPacer::new(22050, DEFAULT_TICKS_PER_SECOND);
        let total: usize = (0..100).map(|_| pacer.next_tick()).sum();
        assert_eq!(total, 22050);
        assert_eq!(pacer.max_tick_blocks(), 221);
    }
}
