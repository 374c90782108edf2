//! 采样率比例规划
//!
//! 输出/输入采样率分解质因数，约去公因子后，把剩余因子贪心打包成
//! 一串小的 (L, M) 插值/抽取级。每级的 L、M 都很小，
//! 限制了中间缓冲区大小和单级滤波误差
//!
//! 全部是无状态纯函数

use super::ResampleError;

/// 质数表（升序）。超出表内质数的因子无法表示
pub const PRIMES: [u32; 11] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31];

/// 质因子及其指数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Factor {
    pub prime: u32,
    pub count: u32,
}

impl Factor {
    pub const fn new(prime: u32, count: u32) -> Self {
        Self { prime, count }
    }
}

/// 一级缩放：先插值 L 倍，再抽取 M 倍
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScalingStage {
    pub l: u32,
    pub m: u32,
}

impl ScalingStage {
    pub const fn new(l: u32, m: u32) -> Self {
        Self { l, m }
    }

    #[inline]
    pub fn is_passthrough(&self) -> bool {
        self.l == 1 && self.m == 1
    }

    /// 输出块数上界：ceil(blocks * L / M) + 1（+1 为相位余量）
    #[inline]
    pub fn max_output(&self, blocks: usize) -> usize {
        (blocks * self.l as usize).div_ceil(self.m as usize) + 1
    }
}

/// 质因数分解，按质数升序返回
///
/// 余下的因子超出质数表时返回 `UnrepresentableRatio`
pub fn factorize(value: u32) -> Result<Vec<Factor>, ResampleError> {
    if value == 0 {
        return Err(ResampleError::UnrepresentableRatio { value });
    }

    let mut factors = Vec::new();
    let mut rest = value;
    for &prime in PRIMES.iter() {
        let mut count = 0;
        while rest % prime == 0 {
            rest /= prime;
            count += 1;
        }
        if count > 0 {
            factors.push(Factor::new(prime, count));
        }
        if rest == 1 {
            break;
        }
    }

    if rest != 1 {
        return Err(ResampleError::UnrepresentableRatio { value });
    }
    Ok(factors)
}

/// 由因子重建数值
pub fn product(factors: &[Factor]) -> u64 {
    factors
        .iter()
        .map(|f| (f.prime as u64).pow(f.count))
        .product()
}

/// 约去公因子：每个共有质数两边同时减去较小的指数
///
/// 指数降为 0 的因子被移除，顺序保持升序
pub fn reduce(l_factors: &mut Vec<Factor>, m_factors: &mut Vec<Factor>) {
    for l in l_factors.iter_mut() {
        if let Some(m) = m_factors.iter_mut().find(|m| m.prime == l.prime) {
            let common = l.count.min(m.count);
            l.count -= common;
            m.count -= common;
        }
    }
    l_factors.retain(|f| f.count > 0);
    m_factors.retain(|f| f.count > 0);
}

/// 规划缩放级序列
///
/// 固定的贪心规则（同样的因子输入永远得到同样的输出）：
/// 1. 取剩余最大的 L 因子开一级
/// 2. 反复取不超过当前累计 L/M 比值（整数除）的最大 M 因子
/// 3. 一个 M 都取不到时，再乘入最小的剩余 L 因子，直到有 M 可取
/// 4. L 因子也用完时，直接配对最大的剩余 M 因子
/// 5. 只剩一侧的因子各自成级，另一侧为 1
pub fn plan(l_factors: &[Factor], m_factors: &[Factor]) -> Vec<ScalingStage> {
    let mut l_left = l_factors.to_vec();
    let mut m_left = m_factors.to_vec();
    let mut stages = Vec::new();

    let mut l_product: u64 = 1;
    let mut m_product: u64 = 1;

    while let Some(i) = largest(&l_left) {
        let mut stage_l = take(&mut l_left[i]);
        let mut stage_m = 1u32;
        l_product *= stage_l as u64;

        loop {
            let ratio = l_product / m_product;

            // 接近 1 的比值：取能放进去的最大 M 因子
            let fit = (0..m_left.len())
                .rev()
                .find(|&k| m_left[k].count > 0 && m_left[k].prime as u64 <= ratio);
            if let Some(k) = fit {
                let prime = take(&mut m_left[k]);
                m_product *= prime as u64;
                stage_m *= prime;
                continue;
            }

            if stage_m != 1 {
                stages.push(ScalingStage::new(stage_l, stage_m));
                break;
            }

            if largest(&m_left).is_none() {
                stages.push(ScalingStage::new(stage_l, 1));
                break;
            }

            if let Some(k) = smallest(&l_left) {
                let prime = take(&mut l_left[k]);
                l_product *= prime as u64;
                stage_l *= prime;
                continue;
            }

            // 最后手段：L 已耗尽，配对最大的 M
            if let Some(k) = largest(&m_left) {
                let prime = take(&mut m_left[k]);
                m_product *= prime as u64;
                stages.push(ScalingStage::new(stage_l, prime));
            }
            break;
        }
    }

    while let Some(k) = largest(&m_left) {
        let prime = take(&mut m_left[k]);
        stages.push(ScalingStage::new(1, prime));
    }

    stages
}

/// 从采样率对直接得到缩放级：分解、约分、规划
pub fn plan_rates(in_rate: u32, out_rate: u32) -> Result<Vec<ScalingStage>, ResampleError> {
    let mut l_factors = factorize(out_rate)?;
    let mut m_factors = factorize(in_rate)?;
    reduce(&mut l_factors, &mut m_factors);
    Ok(plan(&l_factors, &m_factors))
}

#[inline]
fn largest(factors: &[Factor]) -> Option<usize> {
    factors.iter().rposition(|f| f.count > 0)
}

#[inline]
fn smallest(factors: &[Factor]) -> Option<usize> {
    factors.iter().position(|f| f.count > 0)
}

#[inline]
fn take(factor: &mut Factor) -> u32 {
    factor.count -= 1;
    factor.prime
}
