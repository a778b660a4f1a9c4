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

use std::sync::Arc;

/// The error returned when a dedicated task pool could not be constructed.
#[derive(Debug, thiserror::Error)]
#[error("failed to build the task pool: {0}")]
pub struct TaskPoolError(#[from] rayon::ThreadPoolBuildError);

/// A fork/join pool the parallel code paths of this crate execute on.
///
/// All parallelism in this crate is expressed as short fork/join regions scoped onto a
/// [`TaskPool`]; the crate never spawns OS threads directly and never reads global mutable
/// state. The default pool borrows rayon's shared worker threads, [`TaskPool::with_threads`]
/// builds a dedicated pool with an exact worker count. Cloning is cheap and clones share
/// the same workers, so a pool can be handed by value to every stage of a pipeline.
///
/// Nested use is safe: a task submitted from inside another task simply runs on the
/// same workers.
#[derive(Clone, Default)]
pub struct TaskPool {
    dedicated: Option<Arc<rayon::ThreadPool>>,
}

impl TaskPool {
    /// Returns a pool running on rayon's shared worker threads.
    pub fn shared() -> Self {
        Self::default()
    }

    /// Builds a pool with a dedicated set of `num_threads` worker threads.
    ///
    /// # Arguments
    /// * `num_threads`: a [`usize`] worker count, `0` lets the runtime pick one per core.
    ///
    /// # Returns
    /// A [`TaskPool`], or a [`TaskPoolError`] if the underlying pool could not start.
    pub fn with_threads(num_threads: usize) -> Result<Self, TaskPoolError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()?;

        Ok(Self {
            dedicated: Some(Arc::new(pool)),
        })
    }

    /// Returns the number of worker threads fork/join regions will be split across.
    pub fn thread_count(&self) -> usize {
        self.dedicated
            .as_ref()
            .map(|pool| pool.current_num_threads())
            .unwrap_or_else(rayon::current_num_threads)
    }

    /// Runs `op` with this pool installed, so every parallel iterator inside `op`
    /// executes on this pool's workers. Blocks until `op` and all tasks it forked
    /// have completed, and returns `op`'s result.
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match self.dedicated.as_ref() {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Returns the chunk length that splits `len` work items evenly across the workers.
    pub(crate) fn chunk_len(&self, len: usize) -> usize {
        let threads = self.thread_count().max(1);
        ((len + threads - 1) / threads).max(1)
    }
}

impl core::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskPool")
            .field("dedicated", &self.dedicated.is_some())
            .field("thread_count", &self.thread_count())
            .finish()
    }
}
