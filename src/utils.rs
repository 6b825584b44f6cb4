use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Readout statistics: all-time totals plus the rate over a sliding window.
#[derive(Debug, Clone)]
pub struct Counter {
    /// All-time bytes read
    pub total_size: usize,
    /// All-time number of non-empty reads
    pub n_reads: usize,
    pub t_begin: Instant,

    window: Duration,
    reads: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Self::with_window(Duration::from_secs(1))
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_window(window: Duration) -> Self {
        Counter {
            total_size: 0,
            n_reads: 0,
            t_begin: Instant::now(),
            window,
            reads: VecDeque::new(),
            bytes_in_window: 0,
        }
    }

    /// Average rate since `t_begin`, in MB/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.total_size as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Rate over the sliding window, in MB/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / (1024.0 * 1024.0)
    }

    pub fn increment(&mut self, size: usize) {
        self.increment_at(Instant::now(), size);
    }

    fn increment_at(&mut self, now: Instant, size: usize) {
        self.total_size += size;
        self.n_reads += 1;

        self.reads.push_back((now, size));
        self.bytes_in_window += size;

        while let Some(&(ts, sz)) = self.reads.front() {
            if now.duration_since(ts) > self.window {
                self.reads.pop_front();
                self.bytes_in_window -= sz;
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_reads_leave_the_window() {
        let mut counter = Counter::with_window(Duration::from_secs(1));
        let start = Instant::now();
        counter.increment_at(start, 1024 * 1024);
        counter.increment_at(start + Duration::from_millis(500), 1024 * 1024);
        assert!((counter.rate() - 2.0).abs() < 1e-9);

        counter.increment_at(start + Duration::from_millis(1600), 1024 * 1024);
        assert!((counter.rate() - 1.0).abs() < 1e-9);
        assert_eq!(counter.n_reads, 3);
        assert_eq!(counter.total_size, 3 * 1024 * 1024);
    }
}
