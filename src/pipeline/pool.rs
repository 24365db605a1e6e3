//! Fixed fan-out worker pool with a join barrier.

use std::thread;

use tracing::Dispatch;

use crate::errors::panic_message;
use crate::errors::Error;
use crate::errors::Result;

/// Runs a function over contiguous chunks of a vector on a fixed
/// number of threads, then joins.
///
/// Each worker owns its chunk exclusively from split to join; results
/// come back in chunk order, never interleaved.
#[derive(Clone)]
pub struct WorkerPool {
    fan_out: usize,
    /// Log sink re-installed in every worker thread.
    dispatch: Dispatch,
}

impl WorkerPool {
    /// Capture the current log sink for the workers to use.
    pub fn new(fan_out: usize) -> Result<Self> {
        if fan_out == 0 {
            return Err(Error::config("worker pool needs at least one worker"));
        }
        let dispatch = tracing::dispatcher::get_default(Dispatch::clone);
        Ok(Self { fan_out, dispatch })
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    /// Apply `f(offset, chunk)` to each chunk in parallel. `offset` is
    /// the position of the chunk's first item in `items`.
    ///
    /// Chunk sizes differ by at most one, larger chunks first. Fewer
    /// chunks than workers are used when there are fewer items.
    pub fn map<T, R, F>(&self, items: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(usize, Vec<T>) -> R + Sync,
    {
        let chunks = split_even(items, self.fan_out);
        let f = &f;
        thread::scope(|scope| -> Result<Vec<R>> {
            let mut handles = Vec::with_capacity(chunks.len());
            for (index, (offset, chunk)) in chunks.into_iter().enumerate() {
                let dispatch = self.dispatch.clone();
                let handle = thread::Builder::new()
                    .name(format!("worker-{index}"))
                    .spawn_scoped(scope, move || {
                        tracing::dispatcher::with_default(&dispatch, || {
                            tracing::debug_span!("worker", worker = index, offset)
                                .in_scope(|| f(offset, chunk))
                        })
                    })?;
                handles.push(handle);
            }
            handles
                .into_iter()
                .map(|handle| handle.join().map_err(panic_message))
                .collect()
        })
    }
}

/// Split into at most `n` contiguous parts, each tagged with its
/// starting offset.
fn split_even<T>(items: Vec<T>, n: usize) -> Vec<(usize, Vec<T>)> {
    let len = items.len();
    let parts = n.min(len).max(1);
    let base = len / parts;
    let extra = len % parts;

    let mut iter = items.into_iter();
    let mut offset = 0;
    let mut out = Vec::with_capacity(parts);
    for i in 0..parts {
        let size = base + usize::from(i < extra);
        out.push((offset, iter.by_ref().take(size).collect()));
        offset += size;
    }
    out
}

#[test]
fn split_even_matches_array_split() {
    let parts = split_even((0..7).collect::<Vec<_>>(), 3);
    assert_eq!(
        parts,
        vec![(0, vec![0, 1, 2]), (3, vec![3, 4]), (5, vec![5, 6])]
    );
}

#[test]
fn split_even_handles_short_inputs() {
    assert_eq!(split_even(vec![1], 4), vec![(0, vec![1])]);
    assert_eq!(split_even(Vec::<u8>::new(), 2), vec![(0, vec![])]);
}

#[test]
fn map_preserves_chunk_order() {
    let pool = WorkerPool::new(4).unwrap();
    let out = pool
        .map((0..10).collect(), |offset, chunk: Vec<i32>| {
            (offset, chunk.into_iter().map(|x| x * 2).collect::<Vec<_>>())
        })
        .unwrap();
    let offsets: Vec<_> = out.iter().map(|(o, _)| *o).collect();
    assert_eq!(offsets, vec![0, 3, 6, 8]);
    let flat: Vec<_> = out.into_iter().flat_map(|(_, c)| c).collect();
    assert_eq!(flat, (0..10).map(|x| x * 2).collect::<Vec<_>>());
}

#[test]
fn map_reports_worker_panic() {
    let pool = WorkerPool::new(2).unwrap();
    let res = pool.map(vec![1, 2], |_, chunk: Vec<i32>| {
        if chunk.contains(&2) {
            panic!("bad chunk");
        }
        chunk
    });
    assert!(matches!(res, Err(Error::WorkerPanicked(_))));
}

#[test]
fn zero_workers_is_a_config_error() {
    assert!(matches!(WorkerPool::new(0), Err(Error::Config(_))));
}
