// Live-tunable selection cuts and the worker's cancellation flag
//
// Both are plain atomics shared between the controller and the worker thread.
// Nothing here takes a lock: the worker reads the cuts once per sample (or
// once per frame in snapshot mode) and tests the token once per iteration.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Source of the cuts applied while reducing a frame.
pub trait SelectionCuts {
    fn tmin(&self) -> i32;
    fn tmax(&self) -> i32;
    fn threshold(&self) -> i32;
}

/// Time window and threshold, individually updatable from any thread
#[derive(Debug)]
pub struct LiveParameters {
    tmin: AtomicI32,
    tmax: AtomicI32,
    threshold: AtomicI32,
}

impl Default for LiveParameters {
    fn default() -> Self {
        Self::new(1, 1000, 0)
    }
}

impl LiveParameters {
    pub fn new(tmin: i32, tmax: i32, threshold: i32) -> Self {
        Self {
            tmin: AtomicI32::new(tmin),
            tmax: AtomicI32::new(tmax),
            threshold: AtomicI32::new(threshold),
        }
    }

    pub fn set_tmin(&self, t: i32) {
        self.tmin.store(t, Ordering::SeqCst);
    }

    pub fn set_tmax(&self, t: i32) {
        self.tmax.store(t, Ordering::SeqCst);
    }

    pub fn set_threshold(&self, t: i32) {
        self.threshold.store(t, Ordering::SeqCst);
    }

    /// Read all three cuts. The values are loaded one after another, so a
    /// concurrent writer may be observed for some of them only.
    pub fn snapshot(&self) -> ParameterSnapshot {
        ParameterSnapshot {
            tmin: self.tmin(),
            tmax: self.tmax(),
            threshold: self.threshold(),
        }
    }
}

impl SelectionCuts for LiveParameters {
    fn tmin(&self) -> i32 {
        self.tmin.load(Ordering::SeqCst)
    }

    fn tmax(&self) -> i32 {
        self.tmax.load(Ordering::SeqCst)
    }

    fn threshold(&self) -> i32 {
        self.threshold.load(Ordering::SeqCst)
    }
}

/// Cuts frozen for the duration of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterSnapshot {
    pub tmin: i32,
    pub tmax: i32,
    pub threshold: i32,
}

impl SelectionCuts for ParameterSnapshot {
    fn tmin(&self) -> i32 {
        self.tmin
    }

    fn tmax(&self) -> i32 {
        self.tmax
    }

    fn threshold(&self) -> i32 {
        self.threshold
    }
}

/// Keep-reading flag of the acquisition loop
///
/// Starts out stopped. The controller arms it before spawning the worker and
/// clears it to request a stop; the worker clears it itself when the event
/// limit is reached.
#[derive(Debug, Default)]
pub struct CancellationToken {
    running: AtomicBool,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Called by the worker before each frame. `false` means the loop must
    /// end now, without reading another frame.
    pub fn test_and_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
