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

use std::cell::OnceCell;
use std::cmp::Ordering;
use std::fmt;

use super::DEFAULT_K;
use super::DEFAULT_M;
use super::MAX_K;
use super::MAX_M;
use super::MIN_M;
use super::helper::RandomBit;
use super::helper::check_k;
use super::helper::check_m;
use super::helper::compute_total_capacity;
use super::helper::find_level_to_compact;
use super::helper::level_capacity;
use super::helper::normalized_rank_error;
use super::helper::sum_the_sample_weights;
use super::helper::ub_on_num_levels;
use super::iterator::KllSketchIter;
use super::serialization::DATA_START;
use super::serialization::DATA_START_SINGLE_ITEM;
use super::serialization::EMPTY_SIZE_BYTES;
use super::serialization::FLAG_EMPTY;
use super::serialization::FLAG_LEVEL_ZERO_SORTED;
use super::serialization::FLAG_SINGLE_ITEM;
use super::serialization::FLAG_UPDATABLE;
use super::serialization::PREAMBLE_INTS_FULL;
use super::serialization::PREAMBLE_INTS_SHORT;
use super::serialization::SERIAL_VERSION_1;
use super::serialization::SERIAL_VERSION_2;
use super::serialization::SERIAL_VERSION_3;
use super::sorted_view::SortedView;
use crate::codec::Family;
use crate::codec::SketchBytes;
use crate::codec::SketchSlice;
use crate::error::Error;

/// Item operations required by [`KllSketch`].
///
/// The sketch is polymorphic over one capability set: a strict total order, a
/// neutral fill value, an optional "missing" detector, and a byte codec. The
/// provided implementations cover `f32`, `f64`, `i64`, and `String`
/// (length-prefixed UTF-8); user types implement this trait directly.
pub trait KllItem: Clone {
    /// Returns the neutral value used to fill unoccupied buffer slots.
    fn identity() -> Self;

    /// Compare two items.
    fn cmp(a: &Self, b: &Self) -> Ordering;

    /// Returns true if the item denotes a missing value, such as NaN.
    fn is_nan(_value: &Self) -> bool {
        false
    }

    /// Serialized size in bytes.
    fn serialized_size(value: &Self) -> usize;

    /// Serialize a single item into the buffer.
    fn serialize(value: &Self, bytes: &mut SketchBytes);

    /// Serialize a run of items into the buffer.
    fn serialize_many(items: &[Self], bytes: &mut SketchBytes) {
        for item in items {
            Self::serialize(item, bytes);
        }
    }

    /// Deserialize a single item from the input.
    fn deserialize(input: &mut SketchSlice<'_>) -> Result<Self, Error>;

    /// Deserialize a run of `num_items` items from the input.
    fn deserialize_many(input: &mut SketchSlice<'_>, num_items: usize) -> Result<Vec<Self>, Error> {
        let mut items = Vec::with_capacity(num_items);
        for _ in 0..num_items {
            items.push(Self::deserialize(input)?);
        }
        Ok(items)
    }
}

/// KLL sketch for estimating quantiles and ranks.
///
/// The sketch consumes a stream of items in one pass within bounded memory
/// and answers rank, quantile, PMF, and CDF queries with a normalized-rank
/// error governed by the parameter `k`. Sketches with the same `m` are
/// mergeable, including across different `k`.
///
/// A single sketch is not thread safe: updates, merges, queries, and
/// serialization all mutate or lazily materialize state. Use one sketch per
/// thread and merge at a barrier.
///
/// See the [kll module level documentation](crate::kll) for more.
#[derive(Debug, Clone)]
pub struct KllSketch<T: KllItem> {
    k: u16,
    m: u8,
    min_k: u16,
    n: u64,
    num_levels: u8,
    is_level_zero_sorted: bool,
    read_only: bool,
    // levels[l] is the start of level l in items; levels[num_levels] is the
    // buffer capacity. The array may be longer than num_levels + 1 after a
    // merge over-grows it.
    levels: Vec<u32>,
    items: Vec<T>,
    min_item: Option<T>,
    max_item: Option<T>,
    sorted_view: OnceCell<SortedView<T>>,
    random: RandomBit,
}

impl<T: KllItem> Default for KllSketch<T> {
    fn default() -> Self {
        Self::new(DEFAULT_K)
    }
}

impl<T: KllItem> KllSketch<T> {
    /// Creates a new sketch with the given value of k and the default m.
    ///
    /// # Panics
    ///
    /// Panics if k is not in [DEFAULT_M, MAX_K].
    ///
    /// # Examples
    ///
    /// ```
    /// # use kll_quantiles::kll::KllSketch;
    /// let sketch = KllSketch::<f64>::new(200);
    /// assert_eq!(sketch.k(), 200);
    /// ```
    pub fn new(k: u16) -> Self {
        Self::with_m(k, DEFAULT_M)
    }

    /// Creates a new sketch with the given values of k and m.
    ///
    /// `k` controls the size of the sketch and the accuracy of its estimates;
    /// the default of 200 yields a normalized rank error of about 1.65%. `m`
    /// is the minimum level width; values other than the default 8 are
    /// uncommon.
    ///
    /// # Panics
    ///
    /// Panics if m is not an even value in [2, 8], or k is not in [m, MAX_K].
    pub fn with_m(k: u16, m: u8) -> Self {
        Self::with_random_source(k, m, RandomBit::default())
    }

    /// Creates a new sketch drawing its compaction randomness from the given
    /// source, so that results are reproducible.
    ///
    /// # Panics
    ///
    /// Panics if m is not an even value in [2, 8], or k is not in [m, MAX_K].
    pub fn with_random_source(k: u16, m: u8, random: RandomBit) -> Self {
        check_m(m);
        check_k(k, m);
        Self {
            k,
            m,
            min_k: k,
            n: 0,
            num_levels: 1,
            is_level_zero_sorted: false,
            read_only: false,
            levels: vec![k as u32, k as u32],
            items: vec![T::identity(); k as usize],
            min_item: None,
            max_item: None,
            sorted_view: OnceCell::new(),
            random,
        }
    }

    /// Returns parameter k used to configure this sketch.
    pub fn k(&self) -> u16 {
        self.k
    }

    /// Returns parameter m, the minimum level width.
    pub fn m(&self) -> u8 {
        self.m
    }

    /// Returns the minimum k over all sketches this one has absorbed; the
    /// rank error reported by the sketch is a function of this value.
    pub fn min_k(&self) -> u16 {
        self.min_k
    }

    /// Returns total weight of the stream.
    pub fn n(&self) -> u64 {
        self.n
    }

    /// Returns true if the sketch has not seen any data.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Returns the number of retained items.
    pub fn num_retained(&self) -> usize {
        (self.levels[self.num_levels as usize] - self.levels[0]) as usize
    }

    /// Returns true if the sketch has started compacting, so that answers are
    /// estimates rather than exact.
    pub fn is_estimation_mode(&self) -> bool {
        self.num_levels > 1
    }

    /// Returns true if the level zero run is currently sorted.
    pub fn is_level_zero_sorted(&self) -> bool {
        self.is_level_zero_sorted
    }

    /// Returns true if this sketch is a read-only snapshot deserialized from
    /// a compact image.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the minimum item seen by the sketch, exact regardless of
    /// estimation mode.
    pub fn min_item(&self) -> Option<&T> {
        self.min_item.as_ref()
    }

    /// Returns the maximum item seen by the sketch, exact regardless of
    /// estimation mode.
    pub fn max_item(&self) -> Option<&T> {
        self.max_item.as_ref()
    }

    /// Returns an iterator over the retained items and their weights, level
    /// zero first.
    pub fn iter(&self) -> KllSketchIter<'_, T> {
        KllSketchIter::new(&self.items, &self.levels, self.num_levels as usize)
    }

    /// Updates the sketch with a new item.
    ///
    /// NaN values are ignored for floating-point types.
    ///
    /// # Panics
    ///
    /// Panics if the sketch is read only.
    pub fn update(&mut self, item: T) {
        self.check_writable();
        if T::is_nan(&item) {
            return;
        }
        self.update_min_max(&item);
        self.internal_update(item);
        self.sorted_view.take();
    }

    /// Merges another sketch into this one. The other sketch is not modified.
    ///
    /// The total weight, minimum, and maximum combine exactly; if the other
    /// sketch is in estimation mode with a smaller k, this sketch inherits
    /// the larger error bound through [`KllSketch::min_k`].
    ///
    /// # Panics
    ///
    /// Panics if the sketches have incompatible m parameters, or if this
    /// sketch is read only.
    pub fn merge(&mut self, other: &KllSketch<T>) {
        self.check_writable();
        if other.is_empty() {
            return;
        }
        assert_eq!(
            self.m, other.m,
            "incompatible m values: {} and {}",
            self.m, other.m
        );

        self.update_min_max_from_other(other);
        let final_n = self.n + other.n;

        for i in other.levels[0]..other.levels[1] {
            self.internal_update(other.items[i as usize].clone());
        }
        if other.num_levels > 1 {
            self.merge_higher_levels(other, final_n);
        }

        self.n = final_n;
        if other.is_estimation_mode() {
            self.min_k = self.min_k.min(other.min_k);
        }
        self.sorted_view.take();

        debug_assert_eq!(self.total_weight(), self.n, "total weight does not match n");
    }

    /// Returns the sketch to the empty state, keeping k, m, and the random
    /// source.
    ///
    /// # Panics
    ///
    /// Panics if the sketch is read only.
    pub fn reset(&mut self) {
        self.check_writable();
        self.min_k = self.k;
        self.n = 0;
        self.num_levels = 1;
        self.is_level_zero_sorted = false;
        self.levels = vec![self.k as u32, self.k as u32];
        self.items = vec![T::identity(); self.k as usize];
        self.min_item = None;
        self.max_item = None;
        self.sorted_view.take();
    }

    /// Returns the normalized rank of the given item, or `None` if the sketch
    /// is empty.
    pub fn rank(&self, item: &T, inclusive: bool) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        Some(self.cached_sorted_view().rank(item, inclusive))
    }

    /// Returns the normalized ranks of the given items, or `None` if the
    /// sketch is empty.
    pub fn ranks(&self, items: &[T], inclusive: bool) -> Option<Vec<f64>> {
        if self.is_empty() {
            return None;
        }
        let view = self.cached_sorted_view();
        Some(
            items
                .iter()
                .map(|item| view.rank(item, inclusive))
                .collect(),
        )
    }

    /// Returns the quantile for the given normalized rank, or `None` if the
    /// sketch is empty.
    ///
    /// # Panics
    ///
    /// Panics if rank is not in [0.0, 1.0].
    pub fn quantile(&self, rank: f64, inclusive: bool) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        Some(self.cached_sorted_view().quantile(rank, inclusive))
    }

    /// Returns the quantiles for the given normalized ranks, or `None` if the
    /// sketch is empty.
    ///
    /// # Panics
    ///
    /// Panics if any rank is not in [0.0, 1.0].
    pub fn quantiles(&self, ranks: &[f64], inclusive: bool) -> Option<Vec<T>> {
        if self.is_empty() {
            return None;
        }
        let view = self.cached_sorted_view();
        Some(
            ranks
                .iter()
                .map(|rank| view.quantile(*rank, inclusive))
                .collect(),
        )
    }

    /// Returns the approximate CDF at the given split points, or `None` if
    /// the sketch is empty. The returned array has one more entry than
    /// `split_points` and ends in 1.0.
    ///
    /// # Panics
    ///
    /// Panics if the split points are not unique, monotonically increasing
    /// and free of NaN values.
    pub fn cdf(&self, split_points: &[T], inclusive: bool) -> Option<Vec<f64>> {
        if self.is_empty() {
            return None;
        }
        Some(self.cached_sorted_view().cdf(split_points, inclusive))
    }

    /// Returns the approximate PMF between the given split points, or `None`
    /// if the sketch is empty.
    ///
    /// # Panics
    ///
    /// Panics if the split points are not unique, monotonically increasing
    /// and free of NaN values.
    pub fn pmf(&self, split_points: &[T], inclusive: bool) -> Option<Vec<f64>> {
        if self.is_empty() {
            return None;
        }
        Some(self.cached_sorted_view().pmf(split_points, inclusive))
    }

    /// Returns the quantiles that cut the stream into `num_equally_sized`
    /// equally-weighted parts, including both end points, or `None` if the
    /// sketch is empty.
    ///
    /// # Panics
    ///
    /// Panics if `num_equally_sized` is zero.
    pub fn partition_boundaries(
        &self,
        num_equally_sized: usize,
        inclusive: bool,
    ) -> Option<Vec<T>> {
        if self.is_empty() {
            return None;
        }
        Some(
            self.cached_sorted_view()
                .partition_boundaries(num_equally_sized, inclusive),
        )
    }

    /// Returns the sorted view of the retained items, or `None` if the sketch
    /// is empty. The view is built on demand and cached until the next
    /// mutation.
    pub fn sorted_view(&self) -> Option<&SortedView<T>> {
        if self.is_empty() {
            return None;
        }
        Some(self.cached_sorted_view())
    }

    /// Returns normalized rank error appropriate for single-rank (CDF) or
    /// histogram (PMF) queries on this sketch.
    pub fn normalized_rank_error(&self, pmf: bool) -> f64 {
        normalized_rank_error(self.min_k, pmf)
    }

    /// Serializes the sketch to the most compact image representing its
    /// state. A sketch deserialized from a compact image is read only; use
    /// [`KllSketch::serialize_updatable`] to round-trip a sketch that should
    /// keep accepting updates.
    pub fn serialize(&self) -> Vec<u8> {
        let size = self.serialized_size_bytes();
        let mut bytes = SketchBytes::with_capacity(size);

        let is_empty = self.is_empty();
        let is_single_item = self.n == 1;

        let preamble_ints = if is_empty || is_single_item {
            PREAMBLE_INTS_SHORT
        } else {
            PREAMBLE_INTS_FULL
        };
        let serial_version = if is_single_item {
            SERIAL_VERSION_2
        } else {
            SERIAL_VERSION_1
        };
        self.write_preamble(&mut bytes, preamble_ints, serial_version, false);

        if is_empty {
            return bytes.into_bytes();
        }

        if is_single_item {
            T::serialize(&self.items[self.levels[0] as usize], &mut bytes);
            return bytes.into_bytes();
        }

        bytes.write_u64_le(self.n);
        bytes.write_u16_le(self.min_k);
        bytes.write_u8(self.num_levels);
        bytes.write_u8(0);
        // the top levels entry is implied by k, m, and num_levels
        for level in 0..self.num_levels as usize {
            bytes.write_u32_le(self.levels[level]);
        }
        self.write_min_max(&mut bytes);
        T::serialize_many(&self.items[self.levels[0] as usize..self.capacity()], &mut bytes);

        bytes.into_bytes()
    }

    /// Serializes the sketch to the updatable image: the full preamble, the
    /// complete levels array, and the whole buffer including free slots.
    pub fn serialize_updatable(&self) -> Vec<u8> {
        let num_levels = self.num_levels as usize;
        let mut size = DATA_START + (num_levels + 1) * 4;
        size += self.min_max_size_bytes();
        for item in &self.items {
            size += T::serialized_size(item);
        }

        let mut bytes = SketchBytes::with_capacity(size);
        self.write_preamble(&mut bytes, PREAMBLE_INTS_FULL, SERIAL_VERSION_3, true);
        bytes.write_u64_le(self.n);
        bytes.write_u16_le(self.min_k);
        bytes.write_u8(self.num_levels);
        bytes.write_u8(0);
        for level in 0..=num_levels {
            bytes.write_u32_le(self.levels[level]);
        }
        self.write_min_max(&mut bytes);
        T::serialize_many(&self.items, &mut bytes);

        bytes.into_bytes()
    }

    /// Returns the size in bytes of the compact image [`KllSketch::serialize`]
    /// produces for the current state.
    pub fn serialized_size_bytes(&self) -> usize {
        if self.is_empty() {
            return EMPTY_SIZE_BYTES;
        }
        if self.n == 1 {
            let item = &self.items[self.levels[0] as usize];
            return DATA_START_SINGLE_ITEM + T::serialized_size(item);
        }

        let mut size = DATA_START + self.num_levels as usize * 4;
        size += self.min_max_size_bytes();
        for item in &self.items[self.levels[0] as usize..self.capacity()] {
            size += T::serialized_size(item);
        }
        size
    }

    /// Deserializes a sketch from bytes.
    ///
    /// All four images are accepted: compact empty, compact single, compact
    /// full, and updatable. A sketch read from a compact image is a read-only
    /// snapshot — it answers queries, serializes, and can be merged into
    /// another sketch, but mutating it panics. A sketch read from an
    /// updatable image is writable.
    pub fn deserialize(bytes: &[u8]) -> Result<KllSketch<T>, Error> {
        fn make_error(tag: &'static str) -> impl FnOnce(std::io::Error) -> Error {
            move |e| Error::insufficient_data(tag).set_source(e)
        }

        let mut cursor = SketchSlice::new(bytes);

        let preamble_ints = cursor.read_u8().map_err(make_error("preamble_ints"))?;
        let serial_version = cursor.read_u8().map_err(make_error("serial_version"))?;
        let family_id = cursor.read_u8().map_err(make_error("family_id"))?;
        let flags = cursor.read_u8().map_err(make_error("flags"))?;
        let k = cursor.read_u16_le().map_err(make_error("k"))?;
        let m = cursor.read_u8().map_err(make_error("m"))?;
        let _unused = cursor.read_u8().map_err(make_error("unused"))?;

        Family::KLL.validate_id(family_id)?;
        if !(MIN_M..=MAX_M).contains(&m) || m % 2 == 1 {
            return Err(Error::config(format!(
                "m must be even and in [{MIN_M}, {MAX_M}], got {m}"
            )));
        }
        if !(m as u16..=MAX_K).contains(&k) {
            return Err(Error::config(format!("k out of range: {k}")));
        }

        let is_empty = (flags & FLAG_EMPTY) != 0;
        let is_single_item = (flags & FLAG_SINGLE_ITEM) != 0;
        let is_level_zero_sorted = (flags & FLAG_LEVEL_ZERO_SORTED) != 0;
        let is_updatable = (flags & FLAG_UPDATABLE) != 0;

        let expected_version = if is_updatable {
            SERIAL_VERSION_3
        } else if is_single_item {
            SERIAL_VERSION_2
        } else {
            SERIAL_VERSION_1
        };
        if serial_version != expected_version {
            return Err(Error::unsupported_serial_version("1, 2 or 3", serial_version));
        }
        let expected_preamble_ints = if !is_updatable && (is_empty || is_single_item) {
            PREAMBLE_INTS_SHORT
        } else {
            PREAMBLE_INTS_FULL
        };
        if preamble_ints != expected_preamble_ints {
            return Err(Error::deserial(format!(
                "invalid preamble ints: expected {expected_preamble_ints}, got {preamble_ints}"
            )));
        }

        if is_updatable {
            return Self::deserialize_updatable(&mut cursor, k, m, is_level_zero_sorted);
        }

        let mut sketch = Self::with_m(k, m);
        sketch.is_level_zero_sorted = is_level_zero_sorted;
        sketch.read_only = true;
        if is_empty {
            return Ok(sketch);
        }

        if is_single_item {
            let item = T::deserialize(&mut cursor)?;
            sketch.n = 1;
            sketch.levels[0] = k as u32 - 1;
            sketch.items[k as usize - 1] = item.clone();
            sketch.min_item = Some(item.clone());
            sketch.max_item = Some(item);
            return Ok(sketch);
        }

        let n = cursor.read_u64_le().map_err(make_error("n"))?;
        let min_k = cursor.read_u16_le().map_err(make_error("min_k"))?;
        let num_levels = cursor.read_u8().map_err(make_error("num_levels"))? as usize;
        let _unused = cursor.read_u8().map_err(make_error("unused2"))?;

        if n < 2 {
            return Err(Error::deserial(format!(
                "full image requires n >= 2, got {n}"
            )));
        }
        let mut levels = Vec::with_capacity(num_levels + 1);
        for _ in 0..num_levels {
            levels.push(cursor.read_u32_le().map_err(make_error("levels"))?);
        }
        let capacity = Self::validate_structure(k, m, min_k, num_levels, &mut levels, n)?;
        if levels[0] as usize == capacity {
            return Err(Error::deserial("full image retains no items"));
        }

        let min_item = T::deserialize(&mut cursor)?;
        let max_item = T::deserialize(&mut cursor)?;
        let num_retained = capacity - levels[0] as usize;
        let retained = T::deserialize_many(&mut cursor, num_retained)?;

        let mut items = vec![T::identity(); capacity];
        for (slot, item) in items[levels[0] as usize..].iter_mut().zip(retained) {
            *slot = item;
        }

        sketch.n = n;
        sketch.min_k = min_k;
        sketch.num_levels = num_levels as u8;
        sketch.levels = levels;
        sketch.items = items;
        sketch.min_item = Some(min_item);
        sketch.max_item = Some(max_item);
        Ok(sketch)
    }

    fn deserialize_updatable(
        cursor: &mut SketchSlice<'_>,
        k: u16,
        m: u8,
        is_level_zero_sorted: bool,
    ) -> Result<KllSketch<T>, Error> {
        fn make_error(tag: &'static str) -> impl FnOnce(std::io::Error) -> Error {
            move |e| Error::insufficient_data(tag).set_source(e)
        }

        let n = cursor.read_u64_le().map_err(make_error("n"))?;
        let min_k = cursor.read_u16_le().map_err(make_error("min_k"))?;
        let num_levels = cursor.read_u8().map_err(make_error("num_levels"))? as usize;
        let _unused = cursor.read_u8().map_err(make_error("unused2"))?;

        let mut levels = Vec::with_capacity(num_levels + 1);
        for _ in 0..=num_levels {
            levels.push(cursor.read_u32_le().map_err(make_error("levels"))?);
        }
        let capacity = Self::validate_structure(k, m, min_k, num_levels, &mut levels, n)?;

        let min_item = T::deserialize(cursor)?;
        let max_item = T::deserialize(cursor)?;
        let items = T::deserialize_many(cursor, capacity)?;

        let mut sketch = Self::with_m(k, m);
        sketch.is_level_zero_sorted = is_level_zero_sorted;
        sketch.n = n;
        sketch.min_k = min_k;
        sketch.num_levels = num_levels as u8;
        sketch.levels = levels;
        sketch.items = items;
        if n > 0 {
            sketch.min_item = Some(min_item);
            sketch.max_item = Some(max_item);
        }
        Ok(sketch)
    }

    /// Validates a deserialized levels array against the capacity implied by
    /// k, m, and num_levels, and the claimed n against the retained weights;
    /// appends the implied top entry when the compact image omitted it.
    /// Returns the capacity.
    fn validate_structure(
        k: u16,
        m: u8,
        min_k: u16,
        num_levels: usize,
        levels: &mut Vec<u32>,
        n: u64,
    ) -> Result<usize, Error> {
        // the capacity arithmetic is defined for at most 61 levels
        if num_levels == 0 || num_levels > 61 {
            return Err(Error::deserial(format!(
                "num_levels must be in [1, 61], got {num_levels}"
            )));
        }
        if min_k < m as u16 || min_k > k {
            return Err(Error::config(format!(
                "min_k must be in [{m}, {k}], got {min_k}"
            )));
        }
        let capacity = compute_total_capacity(k, m, num_levels);
        if levels.len() == num_levels {
            levels.push(capacity);
        } else if levels[num_levels] != capacity {
            return Err(Error::deserial(format!(
                "levels top entry {} does not match capacity {capacity}",
                levels[num_levels]
            )));
        }
        for window in levels.windows(2) {
            if window[1] < window[0] {
                return Err(Error::deserial("levels array must be non-decreasing"));
            }
        }
        if levels[0] > capacity {
            return Err(Error::deserial("levels[0] exceeds capacity"));
        }
        if sum_the_sample_weights(num_levels, levels) != n {
            return Err(Error::deserial(format!(
                "retained weights do not sum to n = {n}"
            )));
        }
        Ok(capacity as usize)
    }

    fn write_preamble(
        &self,
        bytes: &mut SketchBytes,
        preamble_ints: u8,
        serial_version: u8,
        updatable: bool,
    ) {
        let mut flags = 0u8;
        if self.is_empty() {
            flags |= FLAG_EMPTY;
        }
        if self.is_level_zero_sorted {
            flags |= FLAG_LEVEL_ZERO_SORTED;
        }
        if self.n == 1 {
            flags |= FLAG_SINGLE_ITEM;
        }
        if updatable {
            flags |= FLAG_UPDATABLE;
        }
        bytes.write_u8(preamble_ints);
        bytes.write_u8(serial_version);
        bytes.write_u8(Family::KLL.id);
        bytes.write_u8(flags);
        bytes.write_u16_le(self.k);
        bytes.write_u8(self.m);
        bytes.write_u8(0);
    }

    fn write_min_max(&self, bytes: &mut SketchBytes) {
        match (&self.min_item, &self.max_item) {
            (Some(min_item), Some(max_item)) => {
                T::serialize(min_item, bytes);
                T::serialize(max_item, bytes);
            }
            _ => {
                // only reachable for the empty updatable image
                T::serialize(&T::identity(), bytes);
                T::serialize(&T::identity(), bytes);
            }
        }
    }

    fn min_max_size_bytes(&self) -> usize {
        match (&self.min_item, &self.max_item) {
            (Some(min_item), Some(max_item)) => {
                T::serialized_size(min_item) + T::serialized_size(max_item)
            }
            _ => 2 * T::serialized_size(&T::identity()),
        }
    }

    fn capacity(&self) -> usize {
        self.levels[self.num_levels as usize] as usize
    }

    fn check_writable(&self) {
        assert!(!self.read_only, "sketch is read only, cannot write");
    }

    fn cached_sorted_view(&self) -> &SortedView<T> {
        self.sorted_view.get_or_init(|| {
            SortedView::from_levels(
                &self.items,
                &self.levels,
                self.num_levels as usize,
                self.is_level_zero_sorted,
                self.n,
            )
        })
    }

    fn update_min_max(&mut self, item: &T) {
        match self.min_item.as_ref() {
            None => {
                self.min_item = Some(item.clone());
                self.max_item = Some(item.clone());
            }
            Some(min) => {
                if T::cmp(item, min) == Ordering::Less {
                    self.min_item = Some(item.clone());
                }
                if let Some(max) = &self.max_item {
                    if T::cmp(max, item) == Ordering::Less {
                        self.max_item = Some(item.clone());
                    }
                }
            }
        }
    }

    fn update_min_max_from_other(&mut self, other: &KllSketch<T>) {
        match (&self.min_item, &self.max_item) {
            (None, None) => {
                self.min_item = other.min_item.clone();
                self.max_item = other.max_item.clone();
            }
            (Some(min), Some(max)) => {
                if let Some(other_min) = &other.min_item {
                    if T::cmp(other_min, min) == Ordering::Less {
                        self.min_item = Some(other_min.clone());
                    }
                }
                if let Some(other_max) = &other.max_item {
                    if T::cmp(max, other_max) == Ordering::Less {
                        self.max_item = Some(other_max.clone());
                    }
                }
            }
            _ => {
                self.min_item = other.min_item.clone();
                self.max_item = other.max_item.clone();
            }
        }
    }

    fn internal_update(&mut self, item: T) {
        if self.levels[0] == 0 {
            self.compress_while_updating();
        }
        self.n += 1;
        self.is_level_zero_sorted = false;
        let next = (self.levels[0] - 1) as usize;
        self.levels[0] = next as u32;
        self.items[next] = item;
    }

    /// Halves one full level and promotes the surviving items into the level
    /// above at double weight, freeing space at the bottom of the buffer.
    fn compress_while_updating(&mut self) {
        let level = find_level_to_compact(self.k, self.m, self.num_levels as usize, &self.levels);
        if level == self.num_levels as usize - 1 {
            self.add_empty_top_level();
        }

        let raw_beg = self.levels[level] as usize;
        let raw_end = self.levels[level + 1] as usize;
        // level + 2 is in bounds because a new top level was added if needed
        let pop_above = self.levels[level + 2] as usize - raw_end;
        let raw_pop = raw_end - raw_beg;
        let odd_pop = raw_pop % 2 == 1;
        // an odd population leaves one item behind at raw_beg
        let adj_beg = if odd_pop { raw_beg + 1 } else { raw_beg };
        let adj_pop = if odd_pop { raw_pop - 1 } else { raw_pop };
        let half_adj_pop = adj_pop / 2;

        if level == 0 && !self.is_level_zero_sorted {
            self.items[adj_beg..adj_beg + adj_pop].sort_by(T::cmp);
        }
        if pop_above == 0 {
            randomly_halve_up(&mut self.items, adj_beg, adj_pop, &mut self.random);
        } else {
            randomly_halve_down(&mut self.items, adj_beg, adj_pop, &mut self.random);
            merge_sorted_in_place(
                &mut self.items,
                adj_beg,
                half_adj_pop,
                raw_end,
                pop_above,
                adj_beg + half_adj_pop,
            );
        }

        // lower the boundary of the level above
        self.levels[level + 1] -= half_adj_pop as u32;

        if odd_pop {
            // the current level now contains only the leftover item
            self.levels[level] = self.levels[level + 1] - 1;
            let leftover = self.items[raw_beg].clone();
            self.items[self.levels[level] as usize] = leftover;
        } else {
            // the current level is now empty
            self.levels[level] = self.levels[level + 1];
        }

        if level > 0 {
            // shift the data of the levels below up into the freed space,
            // walking from the top so unread slots are never overwritten
            let bottom = self.levels[0] as usize;
            let amount = raw_beg - bottom;
            for i in (0..amount).rev() {
                let moved = self.items[bottom + i].clone();
                self.items[bottom + half_adj_pop + i] = moved;
            }
        }
        for lvl in 0..level {
            self.levels[lvl] += half_adj_pop as u32;
        }
    }

    /// Grows the buffer by the capacity of a new level and opens an empty
    /// level at the top; existing data shifts toward the high end.
    fn add_empty_top_level(&mut self) {
        let cur_num_levels = self.num_levels as usize;
        let cur_total_cap = self.levels[cur_num_levels];
        assert_eq!(
            self.items.len(),
            cur_total_cap as usize,
            "items length must match capacity"
        );
        assert_eq!(self.levels[0], 0, "sketch must be completely full");

        let delta_cap = level_capacity(self.k, cur_num_levels + 1, 0, self.m);
        let new_total_cap = cur_total_cap + delta_cap;

        // merging might have over-grown the levels array already
        if self.levels.len() < cur_num_levels + 2 {
            self.levels.push(0);
        }
        for level in 0..=cur_num_levels {
            self.levels[level] += delta_cap;
        }
        self.levels[cur_num_levels + 1] = new_total_cap;

        let mut new_items = vec![T::identity(); new_total_cap as usize];
        for (i, item) in self.items.drain(..).enumerate() {
            new_items[i + delta_cap as usize] = item;
        }
        self.items = new_items;
        self.num_levels += 1;
    }

    /// Combines the level-1-and-up runs of both sketches and compresses the
    /// result down to the capacity its final number of levels allows.
    fn merge_higher_levels(&mut self, other: &KllSketch<T>, final_n: u64) {
        let tmp_space_needed = self.num_retained() + num_retained_above_level_zero(other);
        let mut workbuf = vec![T::identity(); tmp_space_needed];
        let ub = ub_on_num_levels(final_n);
        let mut worklevels = vec![0u32; ub + 2];
        let mut outlevels = vec![0u32; ub + 2];

        let provisional_num_levels = self.num_levels.max(other.num_levels) as usize;
        self.populate_work_arrays(other, &mut workbuf, &mut worklevels, provisional_num_levels);

        let (new_num_levels, target_item_count, current_item_count) = general_compress(
            self.k,
            self.m,
            provisional_num_levels,
            &mut workbuf,
            &mut worklevels,
            &mut outlevels,
            self.is_level_zero_sorted,
            &mut self.random,
        );
        debug_assert!(new_num_levels <= ub + 1);

        // pad the new buffer with free space at the bottom
        let free_space_at_bottom = (target_item_count - current_item_count) as usize;
        let mut new_items = vec![T::identity(); target_item_count as usize];
        for i in 0..current_item_count as usize {
            new_items[free_space_at_bottom + i] = workbuf[outlevels[0] as usize + i].clone();
        }
        let shift = free_space_at_bottom as u32 - outlevels[0];

        let final_levels_len = self.levels.len().max(new_num_levels + 1);
        let mut new_levels = vec![0u32; final_levels_len];
        for (level, new_level) in new_levels.iter_mut().enumerate().take(new_num_levels + 1) {
            *new_level = outlevels[level] + shift;
        }

        self.num_levels = new_num_levels as u8;
        self.levels = new_levels;
        self.items = new_items;
    }

    /// Concatenates this sketch's and the other sketch's runs level by level
    /// into the work buffer, merge-sorting where both are populated. Level
    /// zero holds only this sketch's run: the other's level zero was already
    /// streamed through the update path.
    fn populate_work_arrays(
        &self,
        other: &KllSketch<T>,
        workbuf: &mut [T],
        worklevels: &mut [u32],
        provisional_num_levels: usize,
    ) {
        worklevels[0] = 0;
        let self_pop_zero = current_level_size(0, self.num_levels as usize, &self.levels) as usize;
        for i in 0..self_pop_zero {
            workbuf[i] = self.items[self.levels[0] as usize + i].clone();
        }
        worklevels[1] = self_pop_zero as u32;

        for level in 1..provisional_num_levels {
            let self_pop = current_level_size(level, self.num_levels as usize, &self.levels) as usize;
            let other_pop = current_level_size(level, other.num_levels as usize, &other.levels) as usize;
            worklevels[level + 1] = worklevels[level] + (self_pop + other_pop) as u32;
            let dst = worklevels[level] as usize;

            if self_pop > 0 && other_pop == 0 {
                let src = self.levels[level] as usize;
                for i in 0..self_pop {
                    workbuf[dst + i] = self.items[src + i].clone();
                }
            } else if self_pop == 0 && other_pop > 0 {
                let src = other.levels[level] as usize;
                for i in 0..other_pop {
                    workbuf[dst + i] = other.items[src + i].clone();
                }
            } else if self_pop > 0 && other_pop > 0 {
                merge_sorted_into(
                    &self.items,
                    self.levels[level] as usize,
                    self_pop,
                    &other.items,
                    other.levels[level] as usize,
                    other_pop,
                    workbuf,
                    dst,
                );
            }
        }
    }

    fn total_weight(&self) -> u64 {
        sum_the_sample_weights(self.num_levels as usize, &self.levels)
    }
}

impl<T: KllItem + fmt::Debug> fmt::Display for KllSketch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "### KLL sketch summary:")?;
        writeln!(f, "   K                   : {}", self.k)?;
        writeln!(f, "   Dynamic min K       : {}", self.min_k)?;
        writeln!(f, "   M                   : {}", self.m)?;
        writeln!(f, "   N                   : {}", self.n)?;
        writeln!(
            f,
            "   Epsilon             : {:.3}%",
            self.normalized_rank_error(false) * 100.0
        )?;
        writeln!(
            f,
            "   Epsilon PMF         : {:.3}%",
            self.normalized_rank_error(true) * 100.0
        )?;
        writeln!(f, "   Empty               : {}", self.is_empty())?;
        writeln!(f, "   Estimation mode     : {}", self.is_estimation_mode())?;
        writeln!(f, "   Levels              : {}", self.num_levels)?;
        writeln!(f, "   Level 0 sorted      : {}", self.is_level_zero_sorted)?;
        writeln!(f, "   Capacity items      : {}", self.capacity())?;
        writeln!(f, "   Retained items      : {}", self.num_retained())?;
        writeln!(f, "   Free space          : {}", self.levels[0])?;
        writeln!(f, "   Read only           : {}", self.read_only)?;
        match (&self.min_item, &self.max_item) {
            (Some(min_item), Some(max_item)) => {
                writeln!(f, "   Min item            : {min_item:?}")?;
                writeln!(f, "   Max item            : {max_item:?}")?;
            }
            _ => {
                writeln!(f, "   Min item            : none")?;
                writeln!(f, "   Max item            : none")?;
            }
        }
        write!(f, "### End sketch summary")
    }
}

fn current_level_size(level: usize, num_levels: usize, levels: &[u32]) -> u32 {
    if level >= num_levels {
        return 0;
    }
    levels[level + 1] - levels[level]
}

fn num_retained_above_level_zero<T: KllItem>(sketch: &KllSketch<T>) -> usize {
    (sketch.levels[sketch.num_levels as usize] - sketch.levels[1]) as usize
}

/// Keeps every second item of the run, biased to the high end, so the
/// surviving half lands in the upper half of the range.
fn randomly_halve_up<T: KllItem>(buf: &mut [T], start: usize, length: usize, random: &mut RandomBit) {
    debug_assert!(length % 2 == 0, "length must be even");
    let half_length = length / 2;
    let offset = random.next_bit();
    let top = start + length - 1;
    for (step, i) in ((start + half_length)..=top).rev().enumerate() {
        let j = top - offset - 2 * step;
        buf[i] = buf[j].clone();
    }
}

/// Keeps every second item of the run, writing the surviving half into the
/// lower half of the range.
fn randomly_halve_down<T: KllItem>(
    buf: &mut [T],
    start: usize,
    length: usize,
    random: &mut RandomBit,
) {
    debug_assert!(length % 2 == 0, "length must be even");
    let half_length = length / 2;
    let offset = random.next_bit();
    let mut j = start + offset;
    for i in start..start + half_length {
        buf[i] = buf[j].clone();
        j += 2;
    }
}

/// Merges two sorted runs of one buffer into a destination range of the same
/// buffer. The destination may overlap run B from below: the write index can
/// only catch up to the read index once run A is exhausted, at which point
/// the remaining copies are no-ops.
fn merge_sorted_in_place<T: KllItem>(
    buf: &mut [T],
    start_a: usize,
    len_a: usize,
    start_b: usize,
    len_b: usize,
    start_c: usize,
) {
    let lim_a = start_a + len_a;
    let lim_b = start_b + len_b;
    let lim_c = start_c + len_a + len_b;

    let mut a = start_a;
    let mut b = start_b;
    for c in start_c..lim_c {
        let src = if a == lim_a {
            let src = b;
            b += 1;
            src
        } else if b == lim_b {
            let src = a;
            a += 1;
            src
        } else if T::cmp(&buf[a], &buf[b]) == Ordering::Less {
            let src = a;
            a += 1;
            src
        } else {
            let src = b;
            b += 1;
            src
        };
        let item = buf[src].clone();
        buf[c] = item;
    }
}

/// Merges a sorted run of each of two source buffers into a destination
/// buffer.
#[allow(clippy::too_many_arguments)]
fn merge_sorted_into<T: KllItem>(
    buf_a: &[T],
    start_a: usize,
    len_a: usize,
    buf_b: &[T],
    start_b: usize,
    len_b: usize,
    dst: &mut [T],
    start_c: usize,
) {
    let lim_a = start_a + len_a;
    let lim_b = start_b + len_b;
    let lim_c = start_c + len_a + len_b;

    let mut a = start_a;
    let mut b = start_b;
    for c in start_c..lim_c {
        if a == lim_a {
            dst[c] = buf_b[b].clone();
            b += 1;
        } else if b == lim_b {
            dst[c] = buf_a[a].clone();
            a += 1;
        } else if T::cmp(&buf_a[a], &buf_b[b]) == Ordering::Less {
            dst[c] = buf_a[a].clone();
            a += 1;
        } else {
            dst[c] = buf_b[b].clone();
            b += 1;
        }
    }
}

/// Walks the merged level runs bottom up, compacting each level that is over
/// capacity while the sketch as a whole is over capacity. The buffer serves
/// as both input and output: compaction only ever moves items downward.
/// Returns the final number of levels, the target capacity for that many
/// levels, and the retained item count.
#[allow(clippy::too_many_arguments)]
fn general_compress<T: KllItem>(
    k: u16,
    m: u8,
    num_levels_in: usize,
    buf: &mut [T],
    in_levels: &mut [u32],
    out_levels: &mut [u32],
    is_level_zero_sorted: bool,
    random: &mut RandomBit,
) -> (usize, u32, u32) {
    let mut num_levels = num_levels_in;
    let mut current_item_count = in_levels[num_levels] - in_levels[0];
    let mut target_item_count = compute_total_capacity(k, m, num_levels);
    out_levels[0] = 0;

    let mut cur_level = 0usize;
    loop {
        // at the current top level, open an empty level above for uniformity,
        // without incrementing num_levels yet
        if cur_level == num_levels - 1 {
            in_levels[cur_level + 2] = in_levels[cur_level + 1];
        }

        let raw_beg = in_levels[cur_level] as usize;
        let raw_lim = in_levels[cur_level + 1] as usize;
        let raw_pop = raw_lim - raw_beg;

        if current_item_count < target_item_count
            || raw_pop < level_capacity(k, num_levels, cur_level, m) as usize
        {
            // copy the level through unchanged
            let dst = out_levels[cur_level] as usize;
            for i in 0..raw_pop {
                let item = buf[raw_beg + i].clone();
                buf[dst + i] = item;
            }
            out_levels[cur_level + 1] = (dst + raw_pop) as u32;
        } else {
            // the sketch is too full and so is this level: compact it
            let pop_above = in_levels[cur_level + 2] as usize - raw_lim;
            let odd_pop = raw_pop % 2 == 1;
            let adj_beg = if odd_pop { raw_beg + 1 } else { raw_beg };
            let adj_pop = if odd_pop { raw_pop - 1 } else { raw_pop };
            let half_adj_pop = adj_pop / 2;

            if odd_pop {
                let dst = out_levels[cur_level] as usize;
                let leftover = buf[raw_beg].clone();
                buf[dst] = leftover;
                out_levels[cur_level + 1] = (dst + 1) as u32;
            } else {
                out_levels[cur_level + 1] = out_levels[cur_level];
            }

            if cur_level == 0 && !is_level_zero_sorted {
                buf[adj_beg..adj_beg + adj_pop].sort_by(T::cmp);
            }
            if pop_above == 0 {
                randomly_halve_up(buf, adj_beg, adj_pop, random);
            } else {
                randomly_halve_down(buf, adj_beg, adj_pop, random);
                merge_sorted_in_place(
                    buf,
                    adj_beg,
                    half_adj_pop,
                    raw_lim,
                    pop_above,
                    adj_beg + half_adj_pop,
                );
            }

            current_item_count -= half_adj_pop as u32;
            // adjust the boundary of the level above
            in_levels[cur_level + 1] -= half_adj_pop as u32;

            // compacting the old top level creates a level, and with it the
            // capacity of a new bottom level
            if cur_level == num_levels - 1 {
                num_levels += 1;
                target_item_count += level_capacity(k, num_levels, 0, m);
            }
        }

        if cur_level == num_levels - 1 {
            break;
        }
        cur_level += 1;
    }

    (num_levels, target_item_count, current_item_count)
}

impl KllItem for f32 {
    fn identity() -> Self {
        0.0
    }

    fn cmp(a: &Self, b: &Self) -> Ordering {
        a.partial_cmp(b).unwrap_or(Ordering::Greater)
    }

    fn is_nan(value: &Self) -> bool {
        value.is_nan()
    }

    fn serialized_size(_value: &Self) -> usize {
        4
    }

    fn serialize(value: &Self, bytes: &mut SketchBytes) {
        bytes.write_f32_le(*value);
    }

    fn deserialize(input: &mut SketchSlice<'_>) -> Result<Self, Error> {
        input
            .read_f32_le()
            .map_err(|e| Error::insufficient_data("f32").set_source(e))
    }
}

impl KllItem for f64 {
    fn identity() -> Self {
        0.0
    }

    fn cmp(a: &Self, b: &Self) -> Ordering {
        a.partial_cmp(b).unwrap_or(Ordering::Greater)
    }

    fn is_nan(value: &Self) -> bool {
        value.is_nan()
    }

    fn serialized_size(_value: &Self) -> usize {
        8
    }

    fn serialize(value: &Self, bytes: &mut SketchBytes) {
        bytes.write_f64_le(*value);
    }

    fn deserialize(input: &mut SketchSlice<'_>) -> Result<Self, Error> {
        input
            .read_f64_le()
            .map_err(|e| Error::insufficient_data("f64").set_source(e))
    }
}

impl KllItem for i64 {
    fn identity() -> Self {
        0
    }

    fn cmp(a: &Self, b: &Self) -> Ordering {
        a.cmp(b)
    }

    fn serialized_size(_value: &Self) -> usize {
        8
    }

    fn serialize(value: &Self, bytes: &mut SketchBytes) {
        bytes.write_i64_le(*value);
    }

    fn deserialize(input: &mut SketchSlice<'_>) -> Result<Self, Error> {
        input
            .read_i64_le()
            .map_err(|e| Error::insufficient_data("i64").set_source(e))
    }
}

impl KllItem for String {
    fn identity() -> Self {
        String::new()
    }

    fn cmp(a: &Self, b: &Self) -> Ordering {
        a.cmp(b)
    }

    fn serialized_size(value: &Self) -> usize {
        4 + value.len()
    }

    fn serialize(value: &Self, bytes: &mut SketchBytes) {
        bytes.write_u32_le(value.len() as u32);
        bytes.write(value.as_bytes());
    }

    fn deserialize(input: &mut SketchSlice<'_>) -> Result<Self, Error> {
        let len = input
            .read_u32_le()
            .map_err(|e| Error::insufficient_data("string_len").set_source(e))?
            as usize;
        let mut buf = vec![0u8; len];
        input
            .read_exact(&mut buf)
            .map_err(|e| Error::insufficient_data("string_bytes").set_source(e))?;
        String::from_utf8(buf).map_err(|_| Error::deserial("invalid utf-8 string"))
    }
}
