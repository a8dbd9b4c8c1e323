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

use std::cmp::Ordering;

use super::sketch::KllItem;

/// Read-only materialization of the retained items sorted by value, paired
/// with cumulative natural weights.
///
/// The view owns its own copies of the quantiles and cumulative weights; it is
/// built on demand from a non-empty sketch and cached there until the next
/// mutation.
#[derive(Debug, Clone)]
pub struct SortedView<T: KllItem> {
    quantiles: Vec<T>,
    cum_weights: Vec<u64>,
    total_n: u64,
}

impl<T: KllItem> SortedView<T> {
    /// Builds a view from the retained region of a sketch buffer.
    ///
    /// Each level of the buffer is an already-sorted run (level zero is sorted
    /// here first if needed), so the runs are combined with a blocky tandem
    /// merge-sort: a two-way merge over blocks that sorts the quantiles while
    /// carrying the weights along with identical element motions.
    pub(crate) fn from_levels(
        items: &[T],
        levels: &[u32],
        num_levels: usize,
        level_zero_sorted: bool,
        total_n: u64,
    ) -> Self {
        let offset = levels[0] as usize;
        let num_quantiles = levels[num_levels] as usize - offset;
        assert!(num_quantiles > 0, "sorted view requires retained items");

        let mut quantiles: Vec<T> = items[offset..offset + num_quantiles].to_vec();
        if !level_zero_sorted {
            let level_zero_pop = (levels[1] - levels[0]) as usize;
            quantiles[..level_zero_pop].sort_by(T::cmp);
        }

        // Per-item weights plus the boundaries of the non-empty runs, with
        // empty levels squeezed out. The runs stay contiguous, so block b
        // spans [blocks[b], blocks[b + 1]).
        let mut weights = vec![0u64; num_quantiles];
        let mut blocks = vec![0u32; num_levels + 1];
        let mut num_blocks = 0usize;
        let mut weight = 1u64;
        for level in 0..num_levels {
            let from = levels[level] as usize - offset;
            let to = levels[level + 1] as usize - offset;
            if from < to {
                for w in &mut weights[from..to] {
                    *w = weight;
                }
                blocks[num_blocks] = from as u32;
                blocks[num_blocks + 1] = to as u32;
                num_blocks += 1;
            }
            weight <<= 1;
        }

        blocky_tandem_merge_sort(&mut quantiles, &mut weights, &blocks, num_blocks);
        let total_weight = convert_to_cumulative(&mut weights);
        debug_assert_eq!(total_weight, total_n, "cumulative weight must equal n");

        Self {
            quantiles,
            cum_weights: weights,
            total_n,
        }
    }

    /// Returns the total weight of the stream the view was built from.
    pub fn total_n(&self) -> u64 {
        self.total_n
    }

    /// Returns the number of distinct retained entries.
    pub fn num_retained(&self) -> usize {
        self.quantiles.len()
    }

    /// Returns the normalized rank of the given item.
    pub fn rank(&self, item: &T, inclusive: bool) -> f64 {
        let idx = if inclusive {
            upper_bound(&self.quantiles, item)
        } else {
            lower_bound(&self.quantiles, item)
        };
        if idx == 0 {
            return 0.0;
        }
        self.cum_weights[idx - 1] as f64 / self.total_n as f64
    }

    /// Returns the quantile for the given normalized rank.
    ///
    /// # Panics
    ///
    /// Panics if rank is not in [0.0, 1.0].
    pub fn quantile(&self, rank: f64, inclusive: bool) -> T {
        assert!((0.0..=1.0).contains(&rank), "rank must be in [0.0, 1.0]");
        let len = self.quantiles.len();
        let natural_rank = if inclusive {
            (rank * self.total_n as f64).ceil() as u64
        } else {
            (rank * self.total_n as f64).floor() as u64 + 1
        };
        // first index whose cumulative weight reaches the natural rank
        let idx = lower_bound_by_weight(&self.cum_weights, natural_rank);
        if idx >= len {
            // the exclusive rank == 1.0 case lands past the end
            return self.quantiles[len - 1].clone();
        }
        self.quantiles[idx].clone()
    }

    /// Returns the approximate CDF at the given split points, ending in 1.0.
    ///
    /// # Panics
    ///
    /// Panics if the split points are not unique, monotonically increasing and
    /// free of NaN values.
    pub fn cdf(&self, split_points: &[T], inclusive: bool) -> Vec<f64> {
        check_split_points(split_points);
        let mut buckets = Vec::with_capacity(split_points.len() + 1);
        for item in split_points {
            buckets.push(self.rank(item, inclusive));
        }
        buckets.push(1.0);
        buckets
    }

    /// Returns the approximate PMF between the given split points.
    ///
    /// # Panics
    ///
    /// Panics if the split points are not unique, monotonically increasing and
    /// free of NaN values.
    pub fn pmf(&self, split_points: &[T], inclusive: bool) -> Vec<f64> {
        let mut buckets = self.cdf(split_points, inclusive);
        for i in (1..buckets.len()).rev() {
            buckets[i] -= buckets[i - 1];
        }
        buckets
    }

    /// Returns the quantiles that cut the stream into the given number of
    /// equally-weighted parts, including both end points.
    ///
    /// # Panics
    ///
    /// Panics if `num_equally_sized` is zero.
    pub fn partition_boundaries(&self, num_equally_sized: usize, inclusive: bool) -> Vec<T> {
        assert!(
            num_equally_sized >= 1,
            "number of partitions must be at least 1"
        );
        let mut boundaries = Vec::with_capacity(num_equally_sized + 1);
        for i in 0..=num_equally_sized {
            let rank = i as f64 / num_equally_sized as f64;
            boundaries.push(self.quantile(rank, inclusive));
        }
        boundaries
    }

    /// Returns an iterator over the sorted entries.
    pub fn iter(&self) -> SortedViewIter<'_, T> {
        SortedViewIter {
            view: self,
            index: 0,
        }
    }
}

/// One entry of a sorted view: a retained quantile and its weights.
#[derive(Debug, Clone)]
pub struct SortedViewEntry<'a, T: KllItem> {
    quantile: &'a T,
    weight: u64,
    cum_weight: u64,
}

impl<'a, T: KllItem> SortedViewEntry<'a, T> {
    /// Returns the quantile value.
    pub fn quantile(&self) -> &'a T {
        self.quantile
    }

    /// Returns the natural weight of this entry.
    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Returns the natural rank of this entry, in [1, n] when inclusive and
    /// [0, n) when exclusive.
    pub fn natural_rank(&self, inclusive: bool) -> u64 {
        if inclusive {
            self.cum_weight
        } else {
            self.cum_weight - self.weight
        }
    }
}

/// Iterator over the entries of a [`SortedView`].
pub struct SortedViewIter<'a, T: KllItem> {
    view: &'a SortedView<T>,
    index: usize,
}

impl<'a, T: KllItem> Iterator for SortedViewIter<'a, T> {
    type Item = SortedViewEntry<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.view.quantiles.len() {
            return None;
        }
        let cum_weight = self.view.cum_weights[self.index];
        let prev = if self.index == 0 {
            0
        } else {
            self.view.cum_weights[self.index - 1]
        };
        let entry = SortedViewEntry {
            quantile: &self.view.quantiles[self.index],
            weight: cum_weight - prev,
            cum_weight,
        };
        self.index += 1;
        Some(entry)
    }
}

/// Sorts `quantiles` by value, moving `weights` with identical swaps.
///
/// Each block is already sorted, so the work is a recursive two-way merge over
/// blocks. Both arrays are duplicated once and the recursion alternates the
/// source and destination roles per level, so the final merge lands in the
/// caller's arrays.
fn blocky_tandem_merge_sort<T: KllItem>(
    quantiles: &mut [T],
    weights: &mut [u64],
    blocks: &[u32],
    num_blocks: usize,
) {
    if num_blocks <= 1 {
        return;
    }
    let mut quantiles_tmp = quantiles.to_vec();
    let mut weights_tmp = weights.to_vec();
    blocky_tandem_merge_sort_recursion(
        &mut quantiles_tmp,
        &mut weights_tmp,
        quantiles,
        weights,
        blocks,
        0,
        num_blocks,
    );
}

fn blocky_tandem_merge_sort_recursion<T: KllItem>(
    quantiles_src: &mut [T],
    weights_src: &mut [u64],
    quantiles_dst: &mut [T],
    weights_dst: &mut [u64],
    blocks: &[u32],
    starting_block: usize,
    num_blocks: usize,
) {
    if num_blocks == 1 {
        return;
    }
    let num_blocks_1 = num_blocks / 2;
    let num_blocks_2 = num_blocks - num_blocks_1;
    debug_assert!(num_blocks_1 >= 1);
    debug_assert!(num_blocks_2 >= num_blocks_1);
    let starting_block_1 = starting_block;
    let starting_block_2 = starting_block + num_blocks_1;
    // swap roles of src and dst
    blocky_tandem_merge_sort_recursion(
        quantiles_dst,
        weights_dst,
        quantiles_src,
        weights_src,
        blocks,
        starting_block_1,
        num_blocks_1,
    );
    blocky_tandem_merge_sort_recursion(
        quantiles_dst,
        weights_dst,
        quantiles_src,
        weights_src,
        blocks,
        starting_block_2,
        num_blocks_2,
    );
    tandem_merge(
        quantiles_src,
        weights_src,
        quantiles_dst,
        weights_dst,
        blocks,
        starting_block_1,
        num_blocks_1,
        starting_block_2,
        num_blocks_2,
    );
}

#[allow(clippy::too_many_arguments)]
fn tandem_merge<T: KllItem>(
    quantiles_src: &[T],
    weights_src: &[u64],
    quantiles_dst: &mut [T],
    weights_dst: &mut [u64],
    blocks: &[u32],
    starting_block_1: usize,
    num_blocks_1: usize,
    starting_block_2: usize,
    num_blocks_2: usize,
) {
    let from_1 = blocks[starting_block_1] as usize;
    let to_1 = blocks[starting_block_1 + num_blocks_1] as usize;
    let from_2 = blocks[starting_block_2] as usize;
    let to_2 = blocks[starting_block_2 + num_blocks_2] as usize;

    let mut src_1 = from_1;
    let mut src_2 = from_2;
    let mut dst = from_1;

    while src_1 < to_1 && src_2 < to_2 {
        if T::cmp(&quantiles_src[src_1], &quantiles_src[src_2]) == Ordering::Less {
            quantiles_dst[dst] = quantiles_src[src_1].clone();
            weights_dst[dst] = weights_src[src_1];
            src_1 += 1;
        } else {
            quantiles_dst[dst] = quantiles_src[src_2].clone();
            weights_dst[dst] = weights_src[src_2];
            src_2 += 1;
        }
        dst += 1;
    }
    while src_1 < to_1 {
        quantiles_dst[dst] = quantiles_src[src_1].clone();
        weights_dst[dst] = weights_src[src_1];
        src_1 += 1;
        dst += 1;
    }
    while src_2 < to_2 {
        quantiles_dst[dst] = quantiles_src[src_2].clone();
        weights_dst[dst] = weights_src[src_2];
        src_2 += 1;
        dst += 1;
    }
}

/// Converts individual weights to cumulative weights in place and returns the
/// grand total.
fn convert_to_cumulative(weights: &mut [u64]) -> u64 {
    let mut subtotal = 0u64;
    for weight in weights.iter_mut() {
        subtotal += *weight;
        *weight = subtotal;
    }
    subtotal
}

fn check_split_points<T: KllItem>(split_points: &[T]) {
    let len = split_points.len();
    if len == 1 && T::is_nan(&split_points[0]) {
        panic!("split_points must not contain NaN values");
    }
    for i in 0..len.saturating_sub(1) {
        if T::is_nan(&split_points[i]) || T::is_nan(&split_points[i + 1]) {
            panic!("split_points must not contain NaN values");
        }
        if T::cmp(&split_points[i], &split_points[i + 1]) == Ordering::Less {
            continue;
        }
        panic!("split_points must be unique and monotonically increasing");
    }
}

fn lower_bound<T: KllItem>(quantiles: &[T], item: &T) -> usize {
    let mut left = 0usize;
    let mut right = quantiles.len();
    while left < right {
        let mid = left + (right - left) / 2;
        if T::cmp(&quantiles[mid], item) == Ordering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

fn upper_bound<T: KllItem>(quantiles: &[T], item: &T) -> usize {
    let mut left = 0usize;
    let mut right = quantiles.len();
    while left < right {
        let mid = left + (right - left) / 2;
        if T::cmp(&quantiles[mid], item) == Ordering::Greater {
            right = mid;
        } else {
            left = mid + 1;
        }
    }
    left
}

fn lower_bound_by_weight(cum_weights: &[u64], weight: u64) -> usize {
    let mut left = 0usize;
    let mut right = cum_weights.len();
    while left < right {
        let mid = left + (right - left) / 2;
        if cum_weights[mid] < weight {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}
