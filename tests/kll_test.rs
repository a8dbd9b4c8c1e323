// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use kll_quantiles::kll::DEFAULT_K;
use kll_quantiles::kll::DEFAULT_M;
use kll_quantiles::kll::KllSketch;
use kll_quantiles::kll::MAX_K;
use kll_quantiles::kll::MIN_K;
use kll_quantiles::kll::RandomBit;

const NUMERIC_NOISE_TOLERANCE: f64 = 1e-6;

fn assert_approx_eq(actual: f64, expected: f64, tolerance: f64) {
    let delta = (actual - expected).abs();
    assert!(
        delta <= tolerance,
        "expected {expected} +/- {tolerance}, got {actual}"
    );
}

fn rank_eps(sketch: &KllSketch<f32>) -> f64 {
    sketch.normalized_rank_error(false)
}

fn num_digits(n: usize) -> usize {
    n.to_string().len()
}

fn fixed_len_string(i: usize, digits: usize) -> String {
    format!("{i:>digits$}")
}

#[test]
fn test_k_limits() {
    let _min = KllSketch::<f32>::new(MIN_K);
    let _max = KllSketch::<f32>::new(MAX_K);
    let _min_m = KllSketch::<f32>::with_m(2, 2);
}

#[test]
#[should_panic(expected = "k must be in")]
fn test_k_too_small_panics() {
    KllSketch::<f32>::new(MIN_K - 1);
}

#[test]
#[should_panic(expected = "m must be even and in")]
fn test_odd_m_panics() {
    KllSketch::<f32>::with_m(200, 5);
}

#[test]
#[should_panic(expected = "m must be even and in")]
fn test_large_m_panics() {
    KllSketch::<f32>::with_m(200, 10);
}

#[test]
fn test_empty() {
    let sketch = KllSketch::<f32>::new(DEFAULT_K);
    assert!(sketch.is_empty());
    assert!(!sketch.is_estimation_mode());
    assert!(!sketch.is_read_only());
    assert_eq!(sketch.n(), 0);
    assert_eq!(sketch.k(), DEFAULT_K);
    assert_eq!(sketch.m(), DEFAULT_M);
    assert_eq!(sketch.min_k(), DEFAULT_K);
    assert_eq!(sketch.num_retained(), 0);
    assert!(sketch.min_item().is_none());
    assert!(sketch.max_item().is_none());
    assert!(sketch.rank(&0.0, true).is_none());
    assert!(sketch.ranks(&[0.0f32], true).is_none());
    assert!(sketch.quantile(0.5, true).is_none());
    assert!(sketch.quantiles(&[0.5], true).is_none());
    assert!(sketch.pmf(&[0.0f32], true).is_none());
    assert!(sketch.cdf(&[0.0f32], true).is_none());
    assert!(sketch.partition_boundaries(2, true).is_none());
    assert!(sketch.sorted_view().is_none());
    assert_eq!(sketch.iter().count(), 0);
}

#[test]
#[should_panic(expected = "rank must be in [0.0, 1.0]")]
fn test_quantile_out_of_range_panics() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K);
    sketch.update(0.0);
    sketch.quantile(-1.0, true);
}

#[test]
fn test_one_item() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K);
    sketch.update(1.0);
    assert!(!sketch.is_empty());
    assert!(!sketch.is_estimation_mode());
    assert_eq!(sketch.n(), 1);
    assert_eq!(sketch.num_retained(), 1);
    assert_eq!(sketch.rank(&1.0, false), Some(0.0));
    assert_eq!(sketch.rank(&1.0, true), Some(1.0));
    assert_eq!(sketch.rank(&2.0, false), Some(1.0));
    assert_eq!(sketch.min_item().cloned(), Some(1.0));
    assert_eq!(sketch.max_item().cloned(), Some(1.0));
    assert_eq!(sketch.quantile(0.5, true), Some(1.0));
    assert_eq!(sketch.quantile(0.5, false), Some(1.0));
}

#[test]
fn test_one_string_item() {
    let mut sketch = KllSketch::<String>::new(DEFAULT_K);
    sketch.update("A".to_string());
    assert_eq!(sketch.n(), 1);
    assert_eq!(sketch.min_item().cloned(), Some("A".to_string()));
    assert_eq!(sketch.max_item().cloned(), Some("A".to_string()));
    assert_eq!(sketch.rank(&"A".to_string(), false), Some(0.0));
    assert_eq!(sketch.rank(&"A".to_string(), true), Some(1.0));
    assert_eq!(sketch.rank(&"@".to_string(), true), Some(0.0));
    assert_eq!(sketch.rank(&"B".to_string(), false), Some(1.0));
    assert_eq!(sketch.quantile(0.5, true), Some("A".to_string()));
    assert_eq!(sketch.quantile(0.5, false), Some("A".to_string()));
}

#[test]
fn test_nan_is_ignored() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K);
    sketch.update(f32::NAN);
    assert!(sketch.is_empty());
    sketch.update(0.0);
    sketch.update(f32::NAN);
    assert_eq!(sketch.n(), 1);
}

#[test]
fn test_many_items_exact_mode() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K);
    let n = DEFAULT_K as usize;
    for i in 1..=n {
        sketch.update(i as f32);
        assert_eq!(sketch.n(), i as u64);
    }
    assert!(!sketch.is_empty());
    assert!(!sketch.is_estimation_mode());
    assert_eq!(sketch.num_retained(), n);
    assert_eq!(sketch.min_item().cloned(), Some(1.0));
    assert_eq!(sketch.quantile(0.0, true), Some(1.0));
    assert_eq!(sketch.max_item().cloned(), Some(n as f32));
    assert_eq!(sketch.quantile(1.0, true), Some(n as f32));

    for i in 1..=n {
        let inclusive_rank = i as f64 / n as f64;
        assert_eq!(sketch.rank(&(i as f32), true), Some(inclusive_rank));
        let exclusive_rank = (i - 1) as f64 / n as f64;
        assert_eq!(sketch.rank(&(i as f32), false), Some(exclusive_rank));
    }
}

#[test]
fn test_ten_items_quantiles() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K);
    for i in 1..=10 {
        sketch.update(i as f32);
    }
    assert_eq!(sketch.quantile(0.0, true), Some(1.0));
    assert_eq!(sketch.quantile(0.5, true), Some(5.0));
    assert_eq!(sketch.quantile(0.99, true), Some(10.0));
    assert_eq!(sketch.quantile(1.0, true), Some(10.0));
}

#[test]
fn test_ten_strings() {
    let ten: Vec<String> = ["A", "B", "C", "D", "E", "F", "G", "H", "I", "J"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut sketch = KllSketch::<String>::new(20);
    for item in &ten {
        sketch.update(item.clone());
    }
    assert_eq!(sketch.n(), 10);
    assert_eq!(sketch.num_retained(), 10);

    for (i, item) in ten.iter().enumerate() {
        assert_eq!(sketch.rank(item, true), Some((i + 1) as f64 / 10.0));
        assert_eq!(sketch.rank(item, false), Some(i as f64 / 10.0));
    }

    let inclusive_ranks = sketch.ranks(&ten, true).unwrap();
    let exclusive_ranks = sketch.ranks(&ten, false).unwrap();
    for i in 0..10 {
        assert_eq!(inclusive_ranks[i], (i + 1) as f64 / 10.0);
        assert_eq!(exclusive_ranks[i], i as f64 / 10.0);
    }

    for i in 0..=10 {
        let rank = i as f64 / 10.0;
        let expected = if rank == 1.0 { &ten[i - 1] } else { &ten[i] };
        assert_eq!(sketch.quantile(rank, false).as_ref(), Some(expected));
        let expected = if rank == 0.0 { &ten[i] } else { &ten[i - 1] };
        assert_eq!(sketch.quantile(rank, true).as_ref(), Some(expected));
    }

    // bulk quantiles agree with the single-rank query
    let fractions: Vec<f64> = (0..=10).map(|i| i as f64 / 10.0).collect();
    for inclusive in [false, true] {
        let bulk = sketch.quantiles(&fractions, inclusive).unwrap();
        for (i, fraction) in fractions.iter().enumerate() {
            assert_eq!(sketch.quantile(*fraction, inclusive).unwrap(), bulk[i]);
        }
    }
}

#[test]
fn test_hundred_items_quantiles() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K);
    for i in 0..100 {
        sketch.update(i as f32);
    }
    assert_eq!(sketch.quantile(0.0, true), Some(0.0));
    assert_eq!(sketch.quantile(0.01, true), Some(0.0));
    assert_eq!(sketch.quantile(0.5, true), Some(49.0));
    assert_eq!(sketch.quantile(0.99, true), Some(98.0));
    assert_eq!(sketch.quantile(1.0, true), Some(99.0));
}

#[test]
fn test_many_items_estimation_mode_rank_error() {
    let mut sketch = KllSketch::<f32>::with_random_source(DEFAULT_K, DEFAULT_M, RandomBit::seeded(1));
    let n = 10_000;
    for i in 0..n {
        sketch.update(i as f32);
    }
    assert!(!sketch.is_empty());
    assert!(sketch.is_estimation_mode());
    assert_eq!(sketch.min_item().cloned(), Some(0.0));
    assert_eq!(sketch.max_item().cloned(), Some((n - 1) as f32));

    let rank_eps = rank_eps(&sketch);
    for i in (0..n).step_by(10) {
        let true_rank = i as f64 / n as f64;
        let rank = sketch.rank(&(i as f32), false).unwrap();
        assert_approx_eq(rank, true_rank, rank_eps);
    }

    assert!(sketch.num_retained() > 0);
    assert!(sketch.num_retained() < n as usize);
}

#[test]
fn test_estimation_mode_strings() {
    let mut sketch =
        KllSketch::<String>::with_random_source(DEFAULT_K, DEFAULT_M, RandomBit::seeded(3));
    let n = 100_000;
    let digits = num_digits(n);
    for i in 1..=n {
        sketch.update(fixed_len_string(i, digits));
    }
    assert!(sketch.is_estimation_mode());
    assert_eq!(sketch.min_item().cloned(), Some(fixed_len_string(1, digits)));
    assert_eq!(sketch.max_item().cloned(), Some(fixed_len_string(n, digits)));

    let eps = sketch.normalized_rank_error(true);
    let median_split = fixed_len_string(n / 2, digits);
    let pmf = sketch.pmf(&[median_split], true).unwrap();
    assert_eq!(pmf.len(), 2);
    assert_approx_eq(pmf[0], 0.5, eps);
    assert_approx_eq(pmf[1], 0.5, eps);

    // quantiles are monotone in rank
    let fractions: Vec<f64> = (0..=1000).map(|i| i as f64 / 1000.0).collect();
    let quantiles = sketch.quantiles(&fractions, true).unwrap();
    for pair in quantiles.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
}

#[test]
fn test_rank_cdf_pmf_consistency() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K);
    let n = 200;
    let mut values = Vec::with_capacity(n);
    for i in 0..n {
        sketch.update(i as f32);
        values.push(i as f32);
    }

    for inclusive in [false, true] {
        let ranks = sketch.cdf(&values, inclusive).unwrap();
        let pmf = sketch.pmf(&values, inclusive).unwrap();

        let mut subtotal = 0.0;
        for i in 0..n {
            let rank = sketch.rank(&values[i], inclusive).unwrap();
            assert_eq!(rank, ranks[i]);
            subtotal += pmf[i];
            assert!(
                (ranks[i] - subtotal).abs() <= NUMERIC_NOISE_TOLERANCE,
                "cdf vs pmf mismatch at index {i}"
            );
        }
        subtotal += pmf[n];
        assert!((subtotal - 1.0).abs() <= NUMERIC_NOISE_TOLERANCE);
        assert_eq!(ranks[n], 1.0);

        // the cdf is monotone non-decreasing
        for pair in ranks.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }
}

#[test]
fn test_cdf_pmf_exact_four_strings() {
    let cdf_inclusive = [0.25, 0.50, 0.75, 1.0, 1.0];
    let cdf_exclusive = [0.0, 0.25, 0.50, 0.75, 1.0];
    let pmf_inclusive = [0.25, 0.25, 0.25, 0.25, 0.0];
    let pmf_exclusive = [0.0, 0.25, 0.25, 0.25, 0.25];
    let tolerance = 1e-10;

    let mut sketch = KllSketch::<String>::new(20);
    let items: Vec<String> = ["A", "AB", "ABC", "ABCD"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    for item in &items {
        sketch.update(item.clone());
    }

    let cdf = sketch.cdf(&items, true).unwrap();
    let pmf = sketch.pmf(&items, true).unwrap();
    for i in 0..cdf.len() {
        assert_approx_eq(cdf[i], cdf_inclusive[i], tolerance);
        assert_approx_eq(pmf[i], pmf_inclusive[i], tolerance);
    }

    let cdf = sketch.cdf(&items, false).unwrap();
    let pmf = sketch.pmf(&items, false).unwrap();
    for i in 0..cdf.len() {
        assert_approx_eq(cdf[i], cdf_exclusive[i], tolerance);
        assert_approx_eq(pmf[i], pmf_exclusive[i], tolerance);
    }
}

#[test]
#[should_panic(expected = "split_points must be unique and monotonically increasing")]
fn test_out_of_order_split_points_panics() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K);
    sketch.update(0.0);
    let split_points = [1.0, 0.0];
    let _ = sketch.cdf(&split_points, true);
}

#[test]
#[should_panic(expected = "split_points must be unique and monotonically increasing")]
fn test_duplicate_split_points_panic() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K);
    sketch.update(0.0);
    let split_points = [1.0, 1.0];
    let _ = sketch.pmf(&split_points, true);
}

#[test]
#[should_panic(expected = "split_points must not contain NaN values")]
fn test_nan_split_point_panics() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K);
    sketch.update(0.0);
    let split_points = [f32::NAN];
    let _ = sketch.cdf(&split_points, true);
}

#[test]
fn test_weight_invariant_through_iterator() {
    let mut sketch = KllSketch::<f32>::with_random_source(DEFAULT_K, DEFAULT_M, RandomBit::seeded(5));
    let n = 10_000u64;
    for i in 0..n {
        sketch.update(i as f32);
    }
    let min = sketch.min_item().cloned().unwrap();
    let max = sketch.max_item().cloned().unwrap();
    let mut weight = 0u64;
    for (item, item_weight) in sketch.iter() {
        assert!(*item >= min && *item <= max);
        weight += item_weight;
    }
    assert_eq!(weight, n);
}

#[test]
fn test_partition_boundaries_match_quantiles() {
    let mut sketch = KllSketch::<String>::new(DEFAULT_K);
    for item in ["A", "B", "C", "D"] {
        sketch.update(item.to_string());
    }
    for inclusive in [false, true] {
        let quantiles = sketch.quantiles(&[0.0, 0.5, 1.0], inclusive).unwrap();
        let boundaries = sketch.partition_boundaries(2, inclusive).unwrap();
        assert_eq!(quantiles, boundaries);
        assert_eq!(boundaries.len(), 3);
    }
}

#[test]
#[should_panic(expected = "number of partitions must be at least 1")]
fn test_zero_partitions_panics() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K);
    sketch.update(0.0);
    sketch.partition_boundaries(0, true);
}

#[test]
fn test_reset() {
    let mut sketch = KllSketch::<String>::new(20);
    let n = 100;
    let digits = num_digits(n);
    for i in 1..=n {
        sketch.update(fixed_len_string(i, digits));
    }
    let n1 = sketch.n();
    let min1 = sketch.min_item().cloned().unwrap();
    let max1 = sketch.max_item().cloned().unwrap();

    sketch.reset();
    assert!(sketch.is_empty());
    assert_eq!(sketch.num_retained(), 0);
    assert_eq!(sketch.min_k(), sketch.k());
    assert!(sketch.sorted_view().is_none());

    for i in 1..=n {
        sketch.update(fixed_len_string(i, digits));
    }
    assert_eq!(sketch.n(), n1);
    assert_eq!(sketch.min_item().cloned(), Some(min1));
    assert_eq!(sketch.max_item().cloned(), Some(max1));
}

#[test]
fn test_sorted_view_iterator() {
    let mut sketch = KllSketch::<String>::new(20);
    sketch.update("A".to_string());
    sketch.update("AB".to_string());
    sketch.update("ABC".to_string());

    let view = sketch.sorted_view().unwrap();
    assert_eq!(view.total_n(), 3);
    assert_eq!(view.num_retained(), 3);

    let mut iter = view.iter();
    let entry = iter.next().unwrap();
    assert_eq!(entry.quantile(), "A");
    assert_eq!(entry.weight(), 1);
    assert_eq!(entry.natural_rank(false), 0);
    assert_eq!(entry.natural_rank(true), 1);
    let entry = iter.next().unwrap();
    assert_eq!(entry.quantile(), "AB");
    assert_eq!(entry.weight(), 1);
    assert_eq!(entry.natural_rank(false), 1);
    assert_eq!(entry.natural_rank(true), 2);
    let entry = iter.next().unwrap();
    assert_eq!(entry.quantile(), "ABC");
    assert_eq!(entry.weight(), 1);
    assert_eq!(entry.natural_rank(false), 2);
    assert_eq!(entry.natural_rank(true), 3);
    assert!(iter.next().is_none());
}

#[test]
fn test_sorted_view_entries_are_sorted_in_estimation_mode() {
    let mut sketch = KllSketch::<f32>::with_random_source(20, DEFAULT_M, RandomBit::seeded(9));
    // a deterministic scramble of 0..5000
    for i in 0u64..5000 {
        sketch.update((i * 2654435761 % 5000) as f32);
    }
    let view = sketch.sorted_view().unwrap();
    let quantiles: Vec<f32> = view.iter().map(|entry| *entry.quantile()).collect();
    for pair in quantiles.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
    let total: u64 = view.iter().map(|entry| entry.weight()).sum();
    assert_eq!(total, 5000);
}

#[test]
fn test_min_max_exact_in_estimation_mode() {
    let mut sketch = KllSketch::<f32>::with_random_source(20, DEFAULT_M, RandomBit::seeded(11));
    let mut true_min = f32::INFINITY;
    let mut true_max = f32::NEG_INFINITY;
    for i in 0u64..50_000 {
        let value = (i * 48271 % 65_537) as f32;
        true_min = true_min.min(value);
        true_max = true_max.max(value);
        sketch.update(value);
    }
    assert_eq!(sketch.min_item().cloned(), Some(true_min));
    assert_eq!(sketch.max_item().cloned(), Some(true_max));
}

#[test]
fn test_deterministic_with_seeded_source() {
    let mut sketch1 = KllSketch::<f64>::with_random_source(20, DEFAULT_M, RandomBit::seeded(7));
    let mut sketch2 = KllSketch::<f64>::with_random_source(20, DEFAULT_M, RandomBit::seeded(7));
    for i in 0..10_000 {
        sketch1.update(i as f64);
        sketch2.update(i as f64);
    }
    assert_eq!(sketch1.serialize(), sketch2.serialize());
}

#[test]
fn test_display_summary() {
    let mut sketch = KllSketch::<f64>::new(DEFAULT_K);
    sketch.update(1.0);
    sketch.update(2.0);
    let summary = format!("{sketch}");
    let has_line = |field: &str, value: &str| {
        summary
            .lines()
            .any(|line| line.contains(field) && line.ends_with(value))
    };
    assert!(summary.starts_with("### KLL sketch summary:"));
    assert!(has_line("N", ": 2"));
    assert!(has_line("Read only", ": false"));
    assert!(has_line("Min item", ": 1.0"));
    assert!(has_line("Max item", ": 2.0"));

    let empty = KllSketch::<f64>::new(DEFAULT_K);
    let summary = format!("{empty}");
    assert!(summary
        .lines()
        .any(|line| line.contains("Empty") && line.ends_with(": true")));
    assert!(summary
        .lines()
        .any(|line| line.contains("Min item") && line.ends_with(": none")));
}
