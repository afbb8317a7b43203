// SPDX-License-Identifier: GPL-3.0-only

//! Binary search for the smallest size a filesystem accepts
//!
//! The oracle is monotonic: a resize to any size at or above the minimum
//! succeeds, anything below is refused. The search keeps `bot` as a size known
//! (or assumed, for 0) to be refused and `top` as a size known to fit, and
//! halves the gap until they are adjacent.

use crate::Result;

/// Search state. Advanced by value with [`MinimalSizeSearch::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimalSizeSearch {
    bot: u64,
    top: u64,
    probes: u32,
}

impl MinimalSizeSearch {
    /// Start from an upper bound that is known to fit
    pub fn new(top: u64) -> Self {
        Self {
            bot: 0,
            top,
            probes: 0,
        }
    }

    /// Next size to try, or `None` once `top` is the minimum
    pub fn next_probe(&self) -> Option<u64> {
        if self.top <= self.bot + 1 {
            return None;
        }
        Some(self.bot + (self.top - self.bot) / 2)
    }

    /// Fold in the verdict for `probe`
    pub fn record(self, probe: u64, fits: bool) -> Self {
        let (bot, top) = if fits {
            (self.bot, probe)
        } else {
            (probe, self.top)
        };
        Self {
            bot,
            top,
            probes: self.probes + 1,
        }
    }

    pub fn bounds(&self) -> (u64, u64) {
        (self.bot, self.top)
    }

    pub fn result(&self) -> u64 {
        self.top
    }

    pub fn probes(&self) -> u32 {
        self.probes
    }
}

/// Converged search result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimalSize {
    pub size: u64,
    pub probes: u32,
}

/// Run the search to completion against `fits`. Errors from the oracle abort
/// the search.
pub fn find_minimal_size<F>(top: u64, mut fits: F) -> Result<MinimalSize>
where
    F: FnMut(u64) -> Result<bool>,
{
    let mut search = MinimalSizeSearch::new(top);
    while let Some(probe) = search.next_probe() {
        let verdict = fits(probe)?;
        search = search.record(probe, verdict);
    }

    Ok(MinimalSize {
        size: search.result(),
        probes: search.probes(),
    })
}
