//! Smooth weighted round-robin selection
//!
//! Each candidate carries an effective weight that grows by its configured
//! weight on every pick and drops by the table total when chosen. Over one
//! full cycle (length = sum of weights) each candidate is returned exactly
//! `weight` times, interleaved rather than clustered: weights `[3,1]`
//! yield `A,A,B,A`, not `A,A,A,B`.
//!
//! The selector is pure bookkeeping over a caller-supplied weight table.
//! It holds no candidate data; the pool re-initializes it whenever the
//! eligible set's membership or weights change.

/// Cursor state for one candidate set.
#[derive(Debug, Default)]
pub struct WeightedSelector {
    /// Per-candidate effective weight, same length as the weight table
    /// the selector was last reset against.
    current: Vec<i64>,
}

impl WeightedSelector {
    /// Re-initialize against a new weight table.
    pub fn reset(&mut self, weights: &[u32]) {
        self.current = vec![0; weights.len()];
    }

    /// Pick the next candidate index, or `None` if the table is empty or
    /// every weight is zero.
    ///
    /// A table whose length no longer matches the reset state triggers an
    /// implicit reset; the pool normally prevents this via its
    /// fingerprint check.
    pub fn select(&mut self, weights: &[u32]) -> Option<usize> {
        let total: i64 = weights.iter().map(|&w| i64::from(w)).sum();
        if weights.is_empty() || total == 0 {
            return None;
        }
        if self.current.len() != weights.len() {
            self.reset(weights);
        }
        for (cur, &weight) in self.current.iter_mut().zip(weights) {
            *cur += i64::from(weight);
        }
        let best = self
            .current
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.cmp(b).then(ib.cmp(ia)))
            .map(|(idx, _)| idx)?;
        self.current[best] -= total;
        Some(best)
    }
}
