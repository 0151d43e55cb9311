// =============================================================================
// Quote ring — fixed-capacity tick buffer with zero-copy window views
// =============================================================================

use std::collections::VecDeque;
use std::time::Instant;

/// A validated live quote, stamped at receive time.
#[derive(Debug, Clone)]
pub struct Tick {
    pub symbol: String,
    pub epoch: i64,
    pub quote: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    /// Monotonic receive instant of the underlying frame.
    pub received: Instant,
    /// Wall-clock receive stamp in milliseconds.
    pub received_at_ms: i64,
}

/// Ring of the most recent quotes. Capacity is fixed at construction; pushes
/// beyond capacity evict the oldest entry.
pub struct QuoteRing {
    buf: VecDeque<Tick>,
    cap: usize,
}

impl QuoteRing {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            buf: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, tick: Tick) {
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(tick);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn last(&self) -> Option<&Tick> {
        self.buf.back()
    }

    /// Non-owning view over the last `n` quotes (all of them when `n`
    /// exceeds the current length), oldest first.
    pub fn window(&self, n: usize) -> Window<'_> {
        let (a, b) = self.buf.as_slices();
        let len = self.buf.len();
        let take = n.min(len);
        let skip = len - take;

        if skip < a.len() {
            Window {
                head: &a[skip..],
                tail: b,
            }
        } else {
            Window {
                head: &b[skip - a.len()..],
                tail: &[],
            }
        }
    }
}

/// Zero-copy view over a contiguous-in-time run of quotes. Because the ring
/// wraps, the view is at most two slices; iteration order is oldest first.
#[derive(Debug, Clone, Copy)]
pub struct Window<'a> {
    head: &'a [Tick],
    tail: &'a [Tick],
}

impl<'a> Window<'a> {
    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chronological index: 0 is the oldest quote in the window.
    pub fn get(&self, i: usize) -> Option<&'a Tick> {
        if i < self.head.len() {
            self.head.get(i)
        } else {
            self.tail.get(i - self.head.len())
        }
    }

    pub fn first(&self) -> Option<&'a Tick> {
        self.get(0)
    }

    pub fn last(&self) -> Option<&'a Tick> {
        if self.tail.is_empty() {
            self.head.last()
        } else {
            self.tail.last()
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Tick> + '_ {
        self.head.iter().chain(self.tail.iter())
    }

    /// Quote prices in chronological order.
    pub fn quotes(&self) -> impl Iterator<Item = f64> + '_ {
        self.iter().map(|t| t.quote)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(epoch: i64, quote: f64) -> Tick {
        Tick {
            symbol: "R_100".to_string(),
            epoch,
            quote,
            bid: None,
            ask: None,
            received: Instant::now(),
            received_at_ms: epoch * 1_000,
        }
    }

    #[test]
    fn push_evicts_oldest_at_capacity() {
        let mut ring = QuoteRing::new(3);
        for i in 0..5 {
            ring.push(tick(i, 100.0 + i as f64));
        }
        assert_eq!(ring.len(), 3);
        let quotes: Vec<f64> = ring.window(10).quotes().collect();
        assert_eq!(quotes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn window_returns_last_n_oldest_first() {
        let mut ring = QuoteRing::new(10);
        for i in 0..6 {
            ring.push(tick(i, i as f64));
        }
        let w = ring.window(3);
        assert_eq!(w.len(), 3);
        assert_eq!(w.first().unwrap().quote, 3.0);
        assert_eq!(w.last().unwrap().quote, 5.0);
        assert_eq!(w.get(1).unwrap().quote, 4.0);
        assert!(w.get(3).is_none());
    }

    #[test]
    fn window_survives_wraparound() {
        let mut ring = QuoteRing::new(4);
        // Push enough to wrap the underlying deque several times.
        for i in 0..11 {
            ring.push(tick(i, i as f64));
        }
        let quotes: Vec<f64> = ring.window(4).quotes().collect();
        assert_eq!(quotes, vec![7.0, 8.0, 9.0, 10.0]);

        let quotes2: Vec<f64> = ring.window(2).quotes().collect();
        assert_eq!(quotes2, vec![9.0, 10.0]);
    }

    #[test]
    fn window_larger_than_contents_returns_all() {
        let mut ring = QuoteRing::new(10);
        ring.push(tick(1, 1.0));
        ring.push(tick(2, 2.0));
        let w = ring.window(100);
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn empty_ring_gives_empty_window() {
        let ring = QuoteRing::new(5);
        let w = ring.window(3);
        assert!(w.is_empty());
        assert!(w.first().is_none());
        assert!(w.last().is_none());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut ring = QuoteRing::new(0);
        ring.push(tick(1, 1.0));
        ring.push(tick(2, 2.0));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.last().unwrap().epoch, 2);
    }
}
