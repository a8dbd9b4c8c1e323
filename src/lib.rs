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

//! Streaming quantile estimation with the KLL sketch.
//!
//! A KLL sketch consumes an arbitrarily long stream of comparable items in a
//! single pass, retains a bounded sample of them, and answers rank, quantile,
//! PMF, and CDF queries with a quantifiable normalized-rank error. Sketches
//! are mergeable, so streams can be processed in shards and combined later.
//!
//! # Usage
//!
//! ```rust
//! # use kll_quantiles::kll::KllSketch;
//! let mut sketch = KllSketch::<f64>::new(200);
//! for i in 0..1000 {
//!     sketch.update(i as f64);
//! }
//! let median = sketch.quantile(0.5, true).unwrap();
//! assert!(median > 400.0 && median < 600.0);
//! ```

pub mod codec;
pub mod error;
pub mod kll;
