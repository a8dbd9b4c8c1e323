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

use super::sketch::KllItem;

/// Iterator over the retained items of a sketch and their natural weights.
///
/// Items are visited in buffer order, level zero first; each item of level
/// `l` carries weight `2^l`. No sorted order is implied within level zero.
pub struct KllSketchIter<'a, T: KllItem> {
    items: &'a [T],
    levels: &'a [u32],
    num_levels: usize,
    level: usize,
    index: usize,
    weight: u64,
}

impl<'a, T: KllItem> KllSketchIter<'a, T> {
    pub(crate) fn new(items: &'a [T], levels: &'a [u32], num_levels: usize) -> Self {
        Self {
            items,
            levels,
            num_levels,
            level: 0,
            index: levels[0] as usize,
            weight: 1,
        }
    }
}

impl<'a, T: KllItem> Iterator for KllSketchIter<'a, T> {
    type Item = (&'a T, u64);

    fn next(&mut self) -> Option<Self::Item> {
        while self.level < self.num_levels && self.index >= self.levels[self.level + 1] as usize {
            self.level += 1;
            self.weight <<= 1;
        }
        if self.level >= self.num_levels {
            return None;
        }
        let item = &self.items[self.index];
        self.index += 1;
        Some((item, self.weight))
    }
}
