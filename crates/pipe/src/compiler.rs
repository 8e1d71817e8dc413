//! Bounded waits on asynchronous native compiles.
//!
//! The native framework compiles libraries and pipeline states asynchronously
//! and reports through a callback on a thread it owns. [`MetalCompiler`] issues
//! one such request and blocks until the callback fires or the timeout elapses.
//! The result lives in a reference-counted cell shared with the [`Completion`]
//! handed to the framework, so a callback that fires after the waiter gave up
//! only finds a cell nobody reads anymore.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    converter::ConvertedShader,
    native::{
        ComputePipelineDescriptor, ComputePipelineState, NativeLibrary, RenderPipelineDescriptor,
        RenderPipelineState,
    },
};

/// Asynchronous compile entry points of the native framework.
///
/// Implementations must eventually consume every [`Completion`] they receive,
/// either by calling [`Completion::complete`] or by dropping it.
pub trait NativeCompiler: Send + Sync {
    fn new_library(
        &self,
        shader: &ConvertedShader,
        msl_version: [u8; 2],
        completion: Completion<NativeLibrary>,
    );

    fn new_render_pipeline_state(
        &self,
        desc: &RenderPipelineDescriptor,
        completion: Completion<RenderPipelineState>,
    );

    fn new_compute_pipeline_state(
        &self,
        desc: &ComputePipelineDescriptor,
        completion: Completion<ComputePipelineState>,
    );
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompilerKind {
    Library,
    RenderPipeline,
    ComputePipeline,
}

impl fmt::Display for CompilerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilerKind::Library => write!(f, "Shader library"),
            CompilerKind::RenderPipeline => write!(f, "Render pipeline"),
            CompilerKind::ComputePipeline => write!(f, "Compute pipeline"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("{kind} compile of {label:?} failed: {message}")]
    Failed {
        kind: CompilerKind,
        label: String,
        message: String,
    },

    #[error("{kind} compile of {label:?} timed out after {timeout:?}")]
    TimedOut {
        kind: CompilerKind,
        label: String,
        timeout: Duration,
    },

    #[error("{kind} compile of {label:?} was dropped without completing")]
    Abandoned { kind: CompilerKind, label: String },
}

enum CompileState<T> {
    Idle,
    Submitted,
    Succeeded(T),
    Failed(String),
    Abandoned,
    TimedOut,
    Consumed,
}

struct CompletionCell<T> {
    kind: CompilerKind,
    state: Mutex<CompileState<T>>,
    cond: Condvar,
}

impl<T> CompletionCell<T> {
    fn resolve(&self, outcome: CompileState<T>) {
        let mut state = self.state.lock();
        match *state {
            CompileState::Submitted => {
                *state = outcome;
                self.cond.notify_all();
            }
            CompileState::TimedOut => {
                tracing::warn!("{} compile completed after its waiter timed out", self.kind);
            }
            _ => {
                tracing::warn!("{} compile completed twice", self.kind);
            }
        }
    }
}

/// Callback handle for one asynchronous compile.
///
/// Dropping it without calling [`complete`](Completion::complete) fails the compile.
pub struct Completion<T> {
    cell: Option<Arc<CompletionCell<T>>>,
}

impl<T> Completion<T> {
    pub fn complete(mut self, result: Result<T, String>) {
        if let Some(cell) = self.cell.take() {
            cell.resolve(match result {
                Ok(value) => CompileState::Succeeded(value),
                Err(message) => CompileState::Failed(message),
            });
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.resolve(CompileState::Abandoned);
        }
    }
}

/// Counters of compile activity of one device.
#[derive(Debug, Default)]
pub struct CompileStats {
    conversions: AtomicU64,
    conversion_nanos: AtomicU64,
    library_compiles: AtomicU64,
    library_nanos: AtomicU64,
    pipeline_compiles: AtomicU64,
    pipeline_nanos: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompileStatsSnapshot {
    pub conversions: u64,
    pub conversion_time: Duration,
    pub library_compiles: u64,
    pub library_time: Duration,
    pub pipeline_compiles: u64,
    pub pipeline_time: Duration,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub failures: u64,
    pub timeouts: u64,
}

fn nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

impl CompileStats {
    pub fn snapshot(&self) -> CompileStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CompileStatsSnapshot {
            conversions: load(&self.conversions),
            conversion_time: Duration::from_nanos(load(&self.conversion_nanos)),
            library_compiles: load(&self.library_compiles),
            library_time: Duration::from_nanos(load(&self.library_nanos)),
            pipeline_compiles: load(&self.pipeline_compiles),
            pipeline_time: Duration::from_nanos(load(&self.pipeline_nanos)),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            failures: load(&self.failures),
            timeouts: load(&self.timeouts),
        }
    }

    pub(crate) fn record_conversion(&self, elapsed: Duration) {
        self.conversions.fetch_add(1, Ordering::Relaxed);
        self.conversion_nanos
            .fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_compile(&self, kind: CompilerKind, elapsed: Duration) {
        let (count, time) = match kind {
            CompilerKind::Library => (&self.library_compiles, &self.library_nanos),
            CompilerKind::RenderPipeline | CompilerKind::ComputePipeline => {
                (&self.pipeline_compiles, &self.pipeline_nanos)
            }
        };
        count.fetch_add(1, Ordering::Relaxed);
        time.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    fn record_error(&self, error: &CompileError) {
        match error {
            CompileError::TimedOut { .. } => self.timeouts.fetch_add(1, Ordering::Relaxed),
            _ => self.failures.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// One-shot wrapper around a single asynchronous native compile.
pub struct MetalCompiler<'a, T> {
    kind: CompilerKind,
    label: String,
    timeout: Duration,
    stats: Option<&'a CompileStats>,
    cell: Arc<CompletionCell<T>>,
}

impl<'a, T> MetalCompiler<'a, T> {
    pub fn new(kind: CompilerKind, label: impl Into<String>, timeout: Duration) -> Self {
        MetalCompiler {
            kind,
            label: label.into(),
            timeout,
            stats: None,
            cell: Arc::new(CompletionCell {
                kind,
                state: Mutex::new(CompileState::Idle),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn with_stats(mut self, stats: &'a CompileStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Hands a completion to `submit` and waits for it.
    ///
    /// `submit` may complete synchronously or pass the completion to another thread.
    pub fn compile(self, submit: impl FnOnce(Completion<T>)) -> Result<T, CompileError> {
        *self.cell.state.lock() = CompileState::Submitted;

        let start = Instant::now();
        submit(Completion {
            cell: Some(self.cell.clone()),
        });

        let result = self.wait(start);
        match &result {
            Ok(_) => {
                let elapsed = start.elapsed();
                tracing::debug!("{} {:?} compiled in {:?}", self.kind, self.label, elapsed);
                if let Some(stats) = self.stats {
                    stats.record_compile(self.kind, elapsed);
                }
            }
            Err(err) => {
                tracing::error!("{}", err);
                if let Some(stats) = self.stats {
                    stats.record_error(err);
                }
            }
        }
        result
    }

    fn wait(&self, start: Instant) -> Result<T, CompileError> {
        let deadline = start + self.timeout;
        let mut state = self.cell.state.lock();

        while let CompileState::Submitted = *state {
            if self.cell.cond.wait_until(&mut state, deadline).timed_out() {
                if let CompileState::Submitted = *state {
                    *state = CompileState::TimedOut;
                    return Err(CompileError::TimedOut {
                        kind: self.kind,
                        label: self.label.clone(),
                        timeout: self.timeout,
                    });
                }
            }
        }

        match std::mem::replace(&mut *state, CompileState::Consumed) {
            CompileState::Succeeded(value) => Ok(value),
            CompileState::Failed(message) => Err(CompileError::Failed {
                kind: self.kind,
                label: self.label.clone(),
                message,
            }),
            _ => Err(CompileError::Abandoned {
                kind: self.kind,
                label: self.label.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn synchronous_completion() {
        let stats = CompileStats::default();
        let value = MetalCompiler::new(CompilerKind::Library, "lib", TIMEOUT)
            .with_stats(&stats)
            .compile(|completion| completion.complete(Ok(7)))
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(stats.snapshot().library_compiles, 1);
    }

    #[test]
    fn completion_from_another_thread() {
        let value = MetalCompiler::new(CompilerKind::RenderPipeline, "rp", Duration::from_secs(5))
            .compile(|completion| {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    completion.complete(Ok("state"));
                });
            })
            .unwrap();

        assert_eq!(value, "state");
    }

    #[test]
    fn reported_failure() {
        let stats = CompileStats::default();
        let err = MetalCompiler::<()>::new(CompilerKind::ComputePipeline, "cp", TIMEOUT)
            .with_stats(&stats)
            .compile(|completion| completion.complete(Err("bad function".to_owned())))
            .unwrap_err();

        assert!(matches!(err, CompileError::Failed { ref message, .. } if message == "bad function"));
        assert_eq!(stats.snapshot().failures, 1);
    }

    #[test]
    fn dropped_completion_fails() {
        let err = MetalCompiler::<()>::new(CompilerKind::Library, "lib", TIMEOUT)
            .compile(drop)
            .unwrap_err();

        assert!(matches!(err, CompileError::Abandoned { .. }));
    }

    #[test]
    fn never_completing_compile_times_out() {
        let stats = CompileStats::default();
        let mut parked = None;

        let start = Instant::now();
        let err = MetalCompiler::<u32>::new(CompilerKind::RenderPipeline, "slow", TIMEOUT)
            .with_stats(&stats)
            .compile(|completion| parked = Some(completion))
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, CompileError::TimedOut { .. }));
        assert!(elapsed >= TIMEOUT);
        assert!(elapsed < TIMEOUT + Duration::from_secs(2));
        assert_eq!(stats.snapshot().timeouts, 1);

        // Late completion after the waiter is gone.
        parked.unwrap().complete(Ok(1));
    }
}
