// SPDX-License-Identifier: MIT
/*
 * Copyright (c) [2023 - Present] Emily Matheys <emilymatt96@gmail.com>
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */

#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! A collection of pure-rust algorithms for aligning 3D point clouds under an unknown rigid transform.
//!
//! The crate is organized as a pipeline of composable stages:
//! nearest-neighbour search ([`knn`]), surface normal estimation ([`normals`]),
//! local shape descriptors ([`descriptors`]), correspondence generation and ranking
//! ([`correspondence`]), and coarse plus fine transform estimation ([`registration`]).
//! All stages share the cloud and result types in [`types`], the distance functions in
//! [`metrics`], and the fork/join helpers in [`parallel`].

#[doc = "Pluggable distance functions over fixed-length numeric vectors and 3D points."]
pub mod metrics;

#[doc = "K-nearest-neighbour and radius search over points or descriptors."]
pub mod knn;

#[doc = "Per-point surface normal estimation using weighted PCA over local neighbourhoods."]
pub mod normals;

#[doc = "Local shape descriptor extraction around selected keypoints."]
pub mod descriptors;

#[doc = "Descriptor matching into correspondences, and correspondence quality ranking."]
pub mod correspondence;

#[doc = "Coarse and fine rigid registration algorithms and their shared iteration framework."]
pub mod registration;

#[doc = "Fork/join task pool the parallel code paths of this crate run on."]
pub mod parallel;

#[doc = "A module containing common and interfacing structs and types."]
pub mod types;

#[doc = "Various utility functions that are commonly used by these algorithms."]
pub mod utils;
