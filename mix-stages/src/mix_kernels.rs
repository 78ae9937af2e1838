//! Mix kernels with AVX SIMD optimization
//!
//! `scale_into` writes `src * scale` into `dest`; `accumulate_scaled` adds it.
//! The AVX paths process 8 floats per iteration and round exactly like the
//! scalar paths (one multiply, one add, no fused multiply-add), so unity gain
//! reproduces the source bit for bit.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

/// `dest[i] = src[i] * scale` with AVX SIMD
///
/// # Safety
/// Requires AVX CPU support. `dest` and `src` must have equal length.
#[target_feature(enable = "avx")]
#[cfg(target_arch = "x86_64")]
pub unsafe fn scale_into_avx(dest: &mut [f32], src: &[f32], scale: f32) {
    let len = dest.len().min(src.len());
    let factor = _mm256_set1_ps(scale);
    let mut i = 0;

    while i + 8 <= len {
        let val = _mm256_loadu_ps(src.as_ptr().add(i));
        _mm256_storeu_ps(dest.as_mut_ptr().add(i), _mm256_mul_ps(val, factor));
        i += 8;
    }

    while i < len {
        dest[i] = src[i] * scale;
        i += 1;
    }
}

/// `dest[i] += src[i] * scale` with AVX SIMD
///
/// # Safety
/// Requires AVX CPU support. `dest` and `src` must have equal length.
#[target_feature(enable = "avx")]
#[cfg(target_arch = "x86_64")]
pub unsafe fn accumulate_scaled_avx(dest: &mut [f32], src: &[f32], scale: f32) {
    let len = dest.len().min(src.len());
    let factor = _mm256_set1_ps(scale);
    let mut i = 0;

    while i + 8 <= len {
        let val = _mm256_mul_ps(_mm256_loadu_ps(src.as_ptr().add(i)), factor);
        let acc = _mm256_loadu_ps(dest.as_ptr().add(i));
        _mm256_storeu_ps(dest.as_mut_ptr().add(i), _mm256_add_ps(acc, val));
        i += 8;
    }

    while i < len {
        dest[i] += src[i] * scale;
        i += 1;
    }
}

/// Scalar fallback for `scale_into`
pub fn scale_into_scalar(dest: &mut [f32], src: &[f32], scale: f32) {
    for (d, s) in dest.iter_mut().zip(src) {
        *d = *s * scale;
    }
}

/// Scalar fallback for `accumulate_scaled`
pub fn accumulate_scaled_scalar(dest: &mut [f32], src: &[f32], scale: f32) {
    for (d, s) in dest.iter_mut().zip(src) {
        *d += *s * scale;
    }
}

/// Auto-dispatch `scale_into` with runtime CPU detection
pub fn scale_into(dest: &mut [f32], src: &[f32], scale: f32) {
    debug_assert_eq!(dest.len(), src.len());
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx") {
            unsafe {
                scale_into_avx(dest, src, scale);
            }
            return;
        }
    }

    scale_into_scalar(dest, src, scale);
}

/// Auto-dispatch `accumulate_scaled` with runtime CPU detection
pub fn accumulate_scaled(dest: &mut [f32], src: &[f32], scale: f32) {
    debug_assert_eq!(dest.len(), src.len());
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx") {
            unsafe {
                accumulate_scaled_avx(dest, src, scale);
            }
            return;
        }
    }

    accumulate_scaled_scalar(dest, src, scale);
}
