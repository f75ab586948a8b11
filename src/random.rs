//! Injectable randomness and identity generation.
//!
//! Every random decision the engine makes (sampling, version draws, the
//! tests-at-once shuffle) goes through [`RandomSource`], and every generated
//! session identity goes through [`IdGenerator`], so a session can be
//! replayed exactly in tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ---------------------------------------------------------------------------
// RandomSource
// ---------------------------------------------------------------------------

/// A source of uniform samples.
pub trait RandomSource {
    /// Uniform sample in `[0, 1)`.
    fn next_f64(&mut self) -> f64;

    /// Uniform index in `[0, len)`. Returns 0 when `len` is 0.
    fn next_index(&mut self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let idx = (self.next_f64() * len as f64).floor() as usize;
        idx.min(len - 1)
    }
}

/// Shuffle `items` in place (Fisher–Yates) using `rng`.
pub fn shuffle<T>(items: &mut [T], rng: &mut dyn RandomSource) {
    for i in (1..items.len()).rev() {
        let j = rng.next_index(i + 1);
        items.swap(i, j);
    }
}

/// Thread-local OS-seeded generator. The default for real sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&mut self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }

    fn next_index(&mut self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..len)
    }
}

/// Reproducible generator seeded from a `u64`.
#[derive(Debug, Clone)]
pub struct SeededRandom {
    rng: StdRng,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    fn next_index(&mut self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.rng.gen_range(0..len)
    }
}

/// Replays a fixed sequence of samples, cycling when exhausted.
///
/// Values are clamped into `[0, 1)`. An empty script always yields `0.0`.
/// [`ScriptedRandom::draws`] counts how many samples were taken, which lets
/// callers assert that a code path did not consume randomness.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRandom {
    script: Vec<f64>,
    cursor: usize,
}

impl ScriptedRandom {
    pub fn new(script: impl Into<Vec<f64>>) -> Self {
        Self { script: script.into(), cursor: 0 }
    }

    /// Number of samples drawn so far.
    pub fn draws(&self) -> usize {
        self.cursor
    }
}

impl RandomSource for ScriptedRandom {
    fn next_f64(&mut self) -> f64 {
        let value = if self.script.is_empty() {
            0.0
        } else {
            self.script[self.cursor % self.script.len()]
        };
        self.cursor += 1;
        value.clamp(0.0, 1.0 - f64::EPSILON)
    }
}

// ---------------------------------------------------------------------------
// IdGenerator
// ---------------------------------------------------------------------------

/// Produces opaque, long-lived session identities.
pub trait IdGenerator {
    fn generate(&mut self) -> String;
}

/// Random UUID v4 identities.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&mut self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

impl<F> IdGenerator for F
where
    F: FnMut() -> String,
{
    fn generate(&mut self) -> String {
        self()
    }
}
