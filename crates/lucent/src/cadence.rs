//! Decode cadence
//!
//! Decoding a latent costs a full decoder pass, so callers usually decode
//! only some steps. Step numbers here are 1-based: step `k` is the state
//! after `k` solver updates.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Default stride between decoded steps
pub const DEFAULT_DECODE_INTERVAL: usize = 5;

/// Default first decoded step
pub const DEFAULT_DECODE_START: usize = 10;

/// When to decode intermediate latents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DecodeCadence {
    /// Decode after every step
    EveryStep,
    /// Decode at `start`, then every `interval`-th step
    Strided { interval: usize, start: usize },
    /// Decode the final step only
    FinalOnly,
}

impl Default for DecodeCadence {
    fn default() -> Self {
        DecodeCadence::Strided {
            interval: DEFAULT_DECODE_INTERVAL,
            start: DEFAULT_DECODE_START,
        }
    }
}

impl DecodeCadence {
    /// Whether step `step` (1-based) of `total` should be decoded.
    ///
    /// The final step is always decoded.
    pub fn should_decode(&self, step: usize, total: usize) -> bool {
        if step == 0 || step > total {
            return false;
        }
        if step == total {
            return true;
        }
        match *self {
            DecodeCadence::EveryStep => true,
            DecodeCadence::Strided { interval, start } => {
                step >= start && (step == start || step % interval.max(1) == 0)
            }
            DecodeCadence::FinalOnly => false,
        }
    }

    /// All steps of a `total`-step run that will be decoded.
    pub fn decode_steps(&self, total: usize) -> SmallVec<[usize; 8]> {
        (1..=total)
            .filter(|&step| self.should_decode(step, total))
            .collect()
    }
}
