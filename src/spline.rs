//! Spline learned index: a piecewise-linear map from a page's minimum key to the physical
//! page it lives on, built incrementally as pages are written and kept within a bounded
//! error so a lookup's estimate plus `max_error` always brackets the true location.
//!
//! Construction follows the standard greedy spline corridor algorithm: each new
//! `(key, page)` sample either still fits inside the error corridor opened at the last
//! committed knot, in which case the corridor just narrows, or it doesn't, in which case
//! the last point that did fit is committed as a new knot and a fresh corridor opens from
//! there.

use crate::key::Key;

#[derive(Debug, Clone, Copy)]
struct Corridor<K> {
    anchor_key: K,
    anchor_page: u32,
    lower_slope: f64,
    upper_slope: f64,
    last_key: K,
    last_page: u32,
}

/// A learned index mapping ascending keys to the page whose min key is closest to, but
/// not greater than, the query key.
pub struct Spline<K: Key> {
    points: Vec<(K, u32)>,
    max_points: usize,
    max_error: u32,
    corridor: Option<Corridor<K>>,
}

impl<K: Key> Spline<K> {
    pub fn new(max_points: usize, max_error: u32) -> Self {
        Spline {
            points: Vec::with_capacity(max_points),
            max_points,
            max_error,
            corridor: None,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Record that page `page`'s minimum key is `key`. Keys must arrive in strictly
    /// ascending order, matching the engine's insert order.
    pub fn add(&mut self, key: K, page: u32) {
        let Some(anchor) = self.points.last().copied() else {
            self.points.push((key, page));
            return;
        };

        match &mut self.corridor {
            None => {
                self.corridor = Some(Self::open_corridor(anchor, key, page, self.max_error));
            }
            Some(c) => {
                if Self::fits(c, key, page, self.max_error) {
                    Self::narrow(c, key, page, self.max_error);
                } else {
                    let knot = (c.last_key, c.last_page);
                    self.commit(knot);
                    self.corridor = Some(Self::open_corridor(knot, key, page, self.max_error));
                }
            }
        }
    }

    fn open_corridor(anchor: (K, u32), key: K, page: u32, max_error: u32) -> Corridor<K> {
        let dk = key.to_u64() as f64 - anchor.0.to_u64() as f64;
        if dk <= 0.0 {
            return Corridor {
                anchor_key: anchor.0,
                anchor_page: anchor.1,
                lower_slope: f64::NEG_INFINITY,
                upper_slope: f64::INFINITY,
                last_key: key,
                last_page: page,
            };
        }
        let lower_slope = (page as f64 - max_error as f64 - anchor.1 as f64) / dk;
        let upper_slope = (page as f64 + max_error as f64 - anchor.1 as f64) / dk;
        Corridor {
            anchor_key: anchor.0,
            anchor_page: anchor.1,
            lower_slope,
            upper_slope,
            last_key: key,
            last_page: page,
        }
    }

    /// A point fits the open corridor if the error window `[page-max_error,
    /// page+max_error]` around it, projected back to a slope range from the corridor's
    /// anchor, still overlaps the corridor's current `[lower_slope, upper_slope]`.
    fn fits(c: &Corridor<K>, key: K, page: u32, max_error: u32) -> bool {
        let dk = key.to_u64() as f64 - c.anchor_key.to_u64() as f64;
        if dk <= 0.0 {
            return true;
        }
        let candidate_lower_slope = (page as f64 - max_error as f64 - c.anchor_page as f64) / dk;
        let candidate_upper_slope = (page as f64 + max_error as f64 - c.anchor_page as f64) / dk;
        candidate_lower_slope <= c.upper_slope && candidate_upper_slope >= c.lower_slope
    }

    fn narrow(c: &mut Corridor<K>, key: K, page: u32, max_error: u32) {
        let dk = key.to_u64() as f64 - c.anchor_key.to_u64() as f64;
        if dk > 0.0 {
            let candidate_lower_slope = (page as f64 - max_error as f64 - c.anchor_page as f64) / dk;
            let candidate_upper_slope = (page as f64 + max_error as f64 - c.anchor_page as f64) / dk;
            c.lower_slope = c.lower_slope.max(candidate_lower_slope);
            c.upper_slope = c.upper_slope.min(candidate_upper_slope);
        }
        c.last_key = key;
        c.last_page = page;
    }

    fn commit(&mut self, knot: (K, u32)) {
        self.points.push(knot);
        if self.points.len() > self.max_points {
            // Drop the oldest interior knot, merging its two neighboring segments. The
            // oldest data is also the first to be evicted by ring wraparound, so this
            // costs accuracy on the part of the keyspace about to disappear anyway.
            self.points.remove(1);
        }
    }

    /// Commit whatever partial corridor is pending (used by `flush`/`close` so the last
    /// page written before a clean shutdown is captured on the next open's recovery scan
    /// without needing a torn, unterminated segment).
    pub fn finish_pending(&mut self) {
        if let Some(c) = self.corridor.take() {
            if self.points.last().map(|p| p.0) != Some(c.last_key) {
                self.points.push((c.last_key, c.last_page));
            }
        }
    }

    /// Remove every knot for a key strictly less than `threshold`, keeping one knot at
    /// or below `threshold` as the new interpolation floor. Called when the data ring
    /// wraps and evicts its oldest pages.
    pub fn evict_before(&mut self, threshold: K) {
        let keep_from = match self.points.iter().rposition(|(k, _)| *k < threshold) {
            Some(idx) => idx,
            None => return,
        };
        self.points.drain(0..keep_from);
    }

    /// Returns a `[low, high]` page bracket estimate for `key`: the true page containing
    /// `key` (if any) lies within this bracket, clamped to the spline's observed page
    /// range plus the configured error bound.
    pub fn find(&self, key: K) -> Option<(u32, u32)> {
        if self.points.is_empty() {
            return None;
        }
        if key.to_u64() < self.points[0].0.to_u64() {
            return None;
        }

        let idx = match self.points.binary_search_by(|(k, _)| k.to_u64().cmp(&key.to_u64())) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };

        let (k0, p0) = self.points[idx];
        // Past the last committed knot, fall back to the open corridor's own most recent
        // sample as the interpolation target. The corridor is only ever committed when it
        // breaks, so for a still-open tail (the common case right after a live insert) this
        // is the only way `find` can see anything newer than the last commit.
        let next = if idx + 1 < self.points.len() {
            Some(self.points[idx + 1])
        } else {
            self.corridor.map(|c| (c.last_key, c.last_page))
        };
        let estimate = match next {
            Some((k1, p1)) => {
                let dk = k1.to_u64() as f64 - k0.to_u64() as f64;
                if dk <= 0.0 {
                    p0 as f64
                } else {
                    let t = (key.to_u64() as f64 - k0.to_u64() as f64) / dk;
                    p0 as f64 + t * (p1 as f64 - p0 as f64)
                }
            }
            None => p0 as f64,
        };

        let lo = (estimate - self.max_error as f64).max(0.0) as u32;
        let hi = (estimate + self.max_error as f64) as u32;
        Some((lo, hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_data_collapses_to_few_knots() {
        let mut spline = Spline::<u32>::new(64, 2);
        for page in 0..200u32 {
            spline.add(page * 10, page);
        }
        spline.finish_pending();
        assert!(spline.len() < 10, "expected a handful of knots, got {}", spline.len());
    }

    #[test]
    fn find_brackets_true_page() {
        let mut spline = Spline::<u32>::new(64, 2);
        for page in 0..50u32 {
            spline.add(page * 10, page);
        }
        spline.finish_pending();

        let (lo, hi) = spline.find(255).unwrap();
        assert!(lo <= 25 && 25 <= hi, "expected bracket around page 25, got [{lo}, {hi}]");
    }

    #[test]
    fn find_sees_the_open_corridor_without_finish_pending() {
        let mut spline = Spline::<u32>::new(64, 2);
        for page in 0..50u32 {
            spline.add(page * 10, page);
        }
        // No `finish_pending()` call: this is the live-session shape, where a lookup can
        // land immediately after a `put`/`write_current_page` with the corridor still open.
        let (lo, hi) = spline.find(480).unwrap();
        assert!(lo <= 48 && 48 <= hi, "expected bracket around page 48, got [{lo}, {hi}]");
    }

    #[test]
    fn evict_before_drops_stale_knots() {
        let mut spline = Spline::<u32>::new(64, 2);
        for page in 0..50u32 {
            spline.add(page * 10, page);
        }
        spline.finish_pending();
        let before = spline.len();
        spline.evict_before(200);
        assert!(spline.len() <= before);
        assert!(spline.points[0].0 <= 200);
    }

    #[test]
    fn bounded_point_count_never_exceeded() {
        let mut spline = Spline::<u32>::new(8, 1);
        for page in 0..500u32 {
            // Irregular spacing defeats the corridor quickly, forcing many commits.
            spline.add(page * page % 997, page);
        }
        spline.finish_pending();
        assert!(spline.len() <= 8);
    }
}
