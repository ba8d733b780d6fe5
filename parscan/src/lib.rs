//! `parscan` — range iteration and inclusive prefix scans over slices.
//!
//! The smoothing engines in `kalman_core` express their batch passes as two
//! primitives: chunked iteration over index ranges and an inclusive prefix
//! scan under a user-supplied associative combiner. Both are provided here in
//! a serial flavour and a data-parallel flavour (rayon) with identical
//! observable results, selected per [`Runtime`].
//!
//! # Scan schedules
//! - [`ScanSchedule::Serial`]  — plain left fold, one combine per element.
//! - [`ScanSchedule::Blocked`] — three-phase block scan (block folds, serial
//!   carry scan, parallel rescan with carries); the `tbb::parallel_scan`
//!   shape.
//! - [`ScanSchedule::OddEven`] — recursive odd-even pair contraction
//!   (Brent–Kung network).
//!
//! All schedules produce, at output position `k` (in scan order), the left
//! fold of the first `k + 1` scanned inputs. Schedules differ only in how
//! that fold is associated, so outputs are identical for exactly associative
//! combiners and agree to rounding for floating-point ones.

use rayon::prelude::*;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for a [`Runtime`]. Passed explicitly at construction; there is no
/// process-global state.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Worker-thread limit. `None` uses the global rayon pool;
    /// `Some(1)` forces serial execution of every primitive.
    pub nthreads: Option<usize>,
    /// Chunk size for range iteration and block size for the blocked scan.
    pub blocksize: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            nthreads: None,
            blocksize: 16,
        }
    }
}

/// Scan direction. `Reverse` scans from the last element toward the first;
/// outputs are returned in scan order (the caller maps indices back).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stride {
    Forward,
    Reverse,
}

/// Evaluation schedule for [`Runtime::prefix_scan`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanSchedule {
    Serial,
    Blocked,
    OddEven,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Execution context for the parallel primitives.
pub struct Runtime {
    pool: Option<rayon::ThreadPool>,
    blocksize: usize,
    serial: bool,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let serial = config.nthreads == Some(1);
        let pool = match config.nthreads {
            Some(n) if n > 1 => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .expect("failed to build worker thread pool"),
            ),
            _ => None,
        };
        Self {
            pool,
            blocksize: config.blocksize.max(1),
            serial,
        }
    }

    /// A runtime that executes every primitive on the calling thread.
    pub fn serial() -> Self {
        Self::new(RuntimeConfig {
            nthreads: Some(1),
            ..RuntimeConfig::default()
        })
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }

    // -----------------------------------------------------------------------
    // Range iteration
    // -----------------------------------------------------------------------

    /// Invoke `f(begin, end)` over consecutive `blocksize`-sized partitions
    /// of `[0, n)`.
    pub fn for_each_range<F>(&self, n: usize, f: F)
    where
        F: Fn(usize, usize) + Sync + Send,
    {
        let bs = self.blocksize;
        if self.serial {
            let mut begin = 0;
            while begin < n {
                let end = (begin + bs).min(n);
                f(begin, end);
                begin = end;
            }
        } else {
            let nblocks = n.div_ceil(bs);
            self.install(|| {
                (0..nblocks).into_par_iter().for_each(|b| {
                    let begin = b * bs;
                    f(begin, (begin + bs).min(n));
                });
            });
        }
    }

    /// Chunked mutable iteration: `f(offset, chunk)` where `chunk` is the
    /// slice `data[offset .. offset + chunk.len()]`. Each element is visited
    /// by exactly one worker.
    pub fn for_each_chunks_mut<T, F>(&self, data: &mut [T], f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Sync + Send,
    {
        let bs = self.blocksize;
        if self.serial {
            for (ci, chunk) in data.chunks_mut(bs).enumerate() {
                f(ci * bs, chunk);
            }
        } else {
            self.install(|| {
                data.par_chunks_mut(bs)
                    .enumerate()
                    .for_each(|(ci, chunk)| f(ci * bs, chunk));
            });
        }
    }

    /// Two-slice variant of [`Runtime::for_each_chunks_mut`]; both slices
    /// must have equal length and are chunked in lockstep.
    pub fn for_each_chunks_mut_two<A, B, F>(&self, a: &mut [A], b: &mut [B], f: F)
    where
        A: Send,
        B: Send,
        F: Fn(usize, &mut [A], &mut [B]) + Sync + Send,
    {
        assert_eq!(a.len(), b.len(), "lockstep chunking requires equal lengths");
        let bs = self.blocksize;
        if self.serial {
            for (ci, (ca, cb)) in a.chunks_mut(bs).zip(b.chunks_mut(bs)).enumerate() {
                f(ci * bs, ca, cb);
            }
        } else {
            self.install(|| {
                a.par_chunks_mut(bs)
                    .zip(b.par_chunks_mut(bs))
                    .enumerate()
                    .for_each(|(ci, (ca, cb))| f(ci * bs, ca, cb));
            });
        }
    }

    // -----------------------------------------------------------------------
    // Prefix scan
    // -----------------------------------------------------------------------

    /// Inclusive prefix scan of `input` under `combine`, which must be
    /// associative. Output position `k` holds the fold of the first `k + 1`
    /// elements in scan order ([`Stride::Reverse`] scans back-to-front and
    /// returns outputs in that order).
    pub fn prefix_scan<T, F>(
        &self,
        input: &[T],
        stride: Stride,
        schedule: ScanSchedule,
        combine: F,
    ) -> Vec<T>
    where
        T: Clone + Send + Sync,
        F: Fn(&T, &T) -> T + Sync + Send,
    {
        let n = input.len();
        if n == 0 {
            return Vec::new();
        }
        // Materialize the scan order once so every schedule sees the same
        // sequence.
        let seq: Vec<&T> = match stride {
            Stride::Forward => input.iter().collect(),
            Stride::Reverse => input.iter().rev().collect(),
        };
        match schedule {
            ScanSchedule::Serial => scan_serial(&seq, &combine),
            ScanSchedule::Blocked => {
                if self.serial || n <= self.blocksize {
                    scan_serial(&seq, &combine)
                } else {
                    self.install(|| self.scan_blocked(&seq, &combine))
                }
            }
            ScanSchedule::OddEven => {
                let vals: Vec<T> = seq.iter().map(|x| T::clone(x)).collect();
                let parallel = !self.serial;
                self.install(|| scan_oddeven(&vals, &combine, parallel, self.blocksize))
            }
        }
    }

    fn scan_blocked<T, F>(&self, seq: &[&T], combine: &F) -> Vec<T>
    where
        T: Clone + Send + Sync,
        F: Fn(&T, &T) -> T + Sync + Send,
    {
        let n = seq.len();
        let bs = self.blocksize;
        let nblocks = n.div_ceil(bs);

        // Phase 1: independent inclusive scans of each block.
        let mut local: Vec<Vec<T>> = (0..nblocks)
            .into_par_iter()
            .map(|b| {
                let begin = b * bs;
                let end = (begin + bs).min(n);
                let mut block = Vec::with_capacity(end - begin);
                let mut acc = T::clone(seq[begin]);
                block.push(acc.clone());
                for item in &seq[begin + 1..end] {
                    acc = combine(&acc, item);
                    block.push(acc.clone());
                }
                block
            })
            .collect();

        // Phase 2: serial exclusive scan of block totals (the carries).
        let mut carries: Vec<Option<T>> = Vec::with_capacity(nblocks);
        let mut acc: Option<T> = None;
        for block in &local {
            carries.push(acc.clone());
            let total = block.last().expect("scan blocks are non-empty");
            acc = Some(match &acc {
                None => T::clone(total),
                Some(a) => combine(a, total),
            });
        }

        // Phase 3: fold each block's carry into its local scan.
        local
            .par_iter_mut()
            .zip(carries.par_iter())
            .for_each(|(block, carry)| {
                if let Some(c) = carry {
                    for item in block.iter_mut() {
                        *item = combine(c, item);
                    }
                }
            });

        local.into_iter().flatten().collect()
    }
}

fn scan_serial<T, F>(seq: &[&T], combine: &F) -> Vec<T>
where
    T: Clone,
    F: Fn(&T, &T) -> T,
{
    let mut out = Vec::with_capacity(seq.len());
    let mut acc = T::clone(seq[0]);
    out.push(acc.clone());
    for item in &seq[1..] {
        acc = combine(&acc, item);
        out.push(acc.clone());
    }
    out
}

/// Odd-even (Brent–Kung) scan: contract adjacent pairs, scan the contracted
/// sequence, then expand. Two combines per element, log-depth.
fn scan_oddeven<T, F>(vals: &[T], combine: &F, parallel: bool, blocksize: usize) -> Vec<T>
where
    T: Clone + Send + Sync,
    F: Fn(&T, &T) -> T + Sync + Send,
{
    let n = vals.len();
    if n == 1 {
        return vec![vals[0].clone()];
    }

    let npairs = n / 2;
    let pairs: Vec<T> = if parallel && npairs >= blocksize {
        (0..npairs)
            .into_par_iter()
            .map(|k| combine(&vals[2 * k], &vals[2 * k + 1]))
            .collect()
    } else {
        (0..npairs)
            .map(|k| combine(&vals[2 * k], &vals[2 * k + 1]))
            .collect()
    };

    let pair_sums = scan_oddeven(&pairs, combine, parallel, blocksize);

    let expand = |i: usize| -> T {
        if i == 0 {
            vals[0].clone()
        } else if i % 2 == 1 {
            pair_sums[i / 2].clone()
        } else {
            combine(&pair_sums[i / 2 - 1], &vals[i])
        }
    };
    if parallel && n >= blocksize {
        (0..n).into_par_iter().map(expand).collect()
    } else {
        (0..n).map(expand).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(nthreads: Option<usize>, blocksize: usize) -> Runtime {
        Runtime::new(RuntimeConfig {
            nthreads,
            blocksize,
        })
    }

    fn expected_prefix_sums(input: &[i64]) -> Vec<i64> {
        let mut out = Vec::new();
        let mut acc = 0;
        for x in input {
            acc += x;
            out.push(acc);
        }
        out
    }

    #[test]
    fn all_schedules_match_left_fold() {
        let input: Vec<i64> = (1..=37).collect();
        let expected = expected_prefix_sums(&input);
        for rt in [runtime(Some(1), 4), runtime(Some(4), 4), runtime(None, 5)] {
            for schedule in [
                ScanSchedule::Serial,
                ScanSchedule::Blocked,
                ScanSchedule::OddEven,
            ] {
                let out = rt.prefix_scan(&input, Stride::Forward, schedule, |a, b| a + b);
                assert_eq!(out, expected, "schedule {schedule:?}");
            }
        }
    }

    #[test]
    fn scan_preserves_order_for_noncommutative_combiner() {
        // String concatenation is associative but not commutative, so any
        // partition-order mistake shows up immediately.
        let input: Vec<String> = "abcdefghijk".chars().map(String::from).collect();
        let rt = runtime(Some(4), 3);
        for schedule in [ScanSchedule::Blocked, ScanSchedule::OddEven] {
            let out = rt.prefix_scan(&input, Stride::Forward, schedule, |a, b| {
                format!("{a}{b}")
            });
            assert_eq!(out.last().map(String::as_str), Some("abcdefghijk"));
            assert_eq!(out[3], "abcd");
        }
    }

    #[test]
    fn reverse_stride_scans_back_to_front() {
        let input = vec![1i64, 2, 3, 4];
        let rt = Runtime::serial();
        let out = rt.prefix_scan(&input, Stride::Reverse, ScanSchedule::Serial, |a, b| a + b);
        // Scan order: 4, 4+3, 4+3+2, 4+3+2+1.
        assert_eq!(out, vec![4, 7, 9, 10]);
    }

    #[test]
    fn scan_of_single_element_and_empty() {
        let rt = Runtime::serial();
        let one = rt.prefix_scan(&[41i64], Stride::Forward, ScanSchedule::OddEven, |a, b| a + b);
        assert_eq!(one, vec![41]);
        let empty: Vec<i64> =
            rt.prefix_scan(&[], Stride::Forward, ScanSchedule::Blocked, |a, b| a + b);
        assert!(empty.is_empty());
    }

    #[test]
    fn for_each_range_covers_all_indices_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let n = 103;
        let hits: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();
        let rt = runtime(Some(3), 8);
        rt.for_each_range(n, |begin, end| {
            for i in begin..end {
                hits[i].fetch_add(1, Ordering::Relaxed);
            }
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn chunked_iteration_writes_each_slot_once() {
        let mut data = vec![0usize; 50];
        let rt = runtime(Some(4), 7);
        rt.for_each_chunks_mut(&mut data, |offset, chunk| {
            for (d, slot) in chunk.iter_mut().enumerate() {
                *slot = offset + d;
            }
        });
        assert!(data.iter().enumerate().all(|(i, &v)| v == i));

        let mut a = vec![0usize; 20];
        let mut b = vec![0usize; 20];
        rt.for_each_chunks_mut_two(&mut a, &mut b, |offset, ca, cb| {
            for d in 0..ca.len() {
                ca[d] = offset + d;
                cb[d] = 2 * (offset + d);
            }
        });
        assert!(a.iter().enumerate().all(|(i, &v)| v == i));
        assert!(b.iter().enumerate().all(|(i, &v)| v == 2 * i));
    }
}
