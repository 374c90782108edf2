//! 窗函数 Sinc 低通 FIR 设计
//!
//! 系数为 2^32 定点的 i64，设计结果为回文（对称）序列

use std::f64::consts::PI;

use super::ResampleError;

/// 定点系数的缩放（2^32）
pub const COEF_SCALE: f64 = 4_294_967_296.0;

/// 低通 FIR 滤波器（不可变，克隆即复制系数数组）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirFilter {
    coefs: Box<[i64]>,
}

impl FirFilter {
    /// 设计 `taps` 阶低通滤波器，截止频率为 `cutoff_freq / sample_freq`
    ///
    /// 系数 = sinc(fc, n) * hamming(taps, n)，n 以 0 为中心。
    /// 奇数阶的中心系数直接取 2 * fc（避开 sinc 的 0/0）；
    /// 偶数阶的 n 落在半整数上，不经过 0
    pub fn design(taps: usize, cutoff_freq: f64, sample_freq: f64) -> Result<Self, ResampleError> {
        if taps == 0 {
            return Err(ResampleError::InvalidTaps(taps));
        }
        let valid = |f: f64| f.is_finite() && f > 0.0;
        if !valid(sample_freq) || !valid(cutoff_freq) {
            return Err(ResampleError::InvalidFrequency {
                cutoff: cutoff_freq,
                sample: sample_freq,
            });
        }

        let fc = cutoff_freq / sample_freq;
        let center = (taps as f64 - 1.0) / 2.0;

        let mut coefs: Vec<i64> = (0..taps)
            .map(|i| {
                let n = i as f64 - center;
                if n == 0.0 {
                    return 0;
                }
                let value = sinc(fc, n) * hamming(taps, n);
                (value * COEF_SCALE) as i64
            })
            .collect();

        if taps % 2 == 1 {
            coefs[taps / 2] = ((fc * COEF_SCALE) as i64) << 1;
        }

        Ok(Self {
            coefs: coefs.into_boxed_slice(),
        })
    }

    /// 系数个数
    #[inline]
    pub fn len(&self) -> usize {
        self.coefs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.coefs.is_empty()
    }

    #[inline]
    pub fn coefs(&self) -> &[i64] {
        &self.coefs
    }

    /// 直流增益（系数和）
    pub fn dc_gain(&self) -> i64 {
        self.coefs.iter().sum()
    }

    /// 多相分解后第 `phase` 相（步长 `stride`）的增益
    pub fn phase_gain(&self, stride: usize, phase: usize) -> i64 {
        self.coefs.iter().skip(phase).step_by(stride.max(1)).sum()
    }
}

#[inline]
fn sinc(fc: f64, n: f64) -> f64 {
    (2.0 * PI * fc * n).sin() / (PI * n)
}

#[inline]
fn hamming(taps: usize, n: f64) -> f64 {
    0.54 + 0.46 * (2.0 * PI * n / taps as f64).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_taps_rejected() {
        assert!(matches!(
            FirFilter::design(0, 1.0, 4.0),
            Err(ResampleError::InvalidTaps(0))
        ));
        assert!(FirFilter::design(15, 1.0, 0.0).is_err());
    }

    #[test]
    fn test_center_coefficient() {
        let filter = FirFilter::design(33, 1.0, 8.0).unwrap();
        // 2 * (1/8) * 2^32
        assert_eq!(filter.coefs()[16], 1i64 << 30);
    }

    #[test]
    fn test_palindromic() {
        for taps in [7usize, 16, 33, 48] {
            let filter = FirFilter::design(taps, 1.0, 6.0).unwrap();
            let c = filter.coefs();
            for i in 0..taps / 2 {
                assert_eq!(c[i], c[taps - 1 - i], "taps={} i={}", taps, i);
            }
        }
    }

    #[test]
    fn test_dc_gain_near_unity() {
        let filter = FirFilter::design(65, 1.0, 4.0).unwrap();
        let gain = filter.dc_gain() as f64 / COEF_SCALE;
        assert!((gain - 1.0).abs() < 0.05, "gain = {}", gain);
    }

    #[test]
    fn test_half_band_is_identity() {
        // fc = 1/2：除中心外的整数点 sinc 为 0，滤波器退化为单位冲激
        let filter = FirFilter::design(9, 1.0, 2.0).unwrap();
        let c = filter.coefs();
        assert_eq!(c[4], 1i64 << 32);
        for (i, &v) in c.iter().enumerate() {
            if i != 4 {
                assert!(v.abs() < 16, "c[{}] = {}", i, v);
            }
        }
    }

    #[test]
    fn test_phase_gains_sum_to_dc_gain() {
        let filter = FirFilter::design(48, 1.0, 8.0).unwrap();
        let total: i64 = (0..4).map(|p| filter.phase_gain(4, p)).sum();
        assert_eq!(total, filter.dc_gain());
    }
}
