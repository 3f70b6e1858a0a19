//! Test helpers shared by the kernel crates.

use half::{bf16, f16};

use crate::element::Element;

/// Element types exercised by the tests, with their tolerances.
pub trait TestFloat: Element {
    const RTOL: f32;
    const ATOL: f32;
}

impl TestFloat for f32 {
    const RTOL: f32 = 1e-4;
    const ATOL: f32 = 1e-5;
}

impl TestFloat for f16 {
    const RTOL: f32 = 1e-2;
    const ATOL: f32 = 5e-3;
}

impl TestFloat for bf16 {
    const RTOL: f32 = 5e-2;
    const ATOL: f32 = 2e-2;
}

/// Asserts that the largest element-wise difference stays within
/// `atol + rtol * |b|` at that element.
pub fn assert_data_close(a: &[f32], b: &[f32], rtol: f32, atol: f32, name: &str) {
    assert_eq!(
        a.len(),
        b.len(),
        "{name}: Data sizes don't match: {} vs {}",
        a.len(),
        b.len()
    );

    let mut max_diff = 0.0f32;
    let mut max_idx = 0;
    let mut max_av = 0.0f32;
    let mut max_bv = 0.0f32;

    for (i, (&av, &bv)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (av - bv).abs();
        assert!(!diff.is_nan(), "{name}: NaN at index {i}: {av} vs {bv}");
        let excess = diff - (atol + rtol * bv.abs());
        let worst = max_diff - (atol + rtol * max_bv.abs());
        if i == 0 || excess > worst {
            max_diff = diff;
            max_idx = i;
            max_av = av;
            max_bv = bv;
        }
    }

    let tolerance = atol + rtol * max_bv.abs();
    assert!(
        max_diff <= tolerance,
        "{name}: Max mismatch at index {max_idx}: {max_av} vs {max_bv} \
         (diff: {max_diff}, tolerance: {tolerance})",
    );
}
