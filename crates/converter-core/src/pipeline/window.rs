//! Count-or-time window accumulation.

use std::time::Duration;
use tokio::time::Instant;

/// Collects items until a count or age threshold is reached.
///
/// The age clock restarts on every flush, so a window closes at least every
/// `max_age` even when nothing arrived.
#[derive(Debug)]
pub struct WindowAccumulator<T> {
    items: Vec<T>,
    max_items: usize,
    max_age: Duration,
    opened_at: Instant,
}

impl<T> WindowAccumulator<T> {
    pub fn new(max_items: usize, max_age: Duration) -> Self {
        Self {
            items: Vec::new(),
            max_items: max_items.max(1),
            max_age,
            opened_at: Instant::now(),
        }
    }

    pub fn add(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_items
    }

    pub fn is_expired(&self) -> bool {
        self.opened_at.elapsed() >= self.max_age
    }

    pub fn should_flush(&self) -> bool {
        self.is_full() || self.is_expired()
    }

    /// Time left before the window expires.
    pub fn remaining(&self) -> Duration {
        self.max_age.saturating_sub(self.opened_at.elapsed())
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Close the window and open a new one.
    pub fn flush(&mut self) -> Vec<T> {
        self.opened_at = Instant::now();
        std::mem::take(&mut self.items)
    }

    /// Put back a window whose write failed, ahead of anything added since.
    pub fn restore(&mut self, mut items: Vec<T>) {
        items.append(&mut self.items);
        self.items = items;
    }

    /// Drop the pending items without writing them.
    pub fn discard(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        self.opened_at = Instant::now();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_on_count() {
        let mut window = WindowAccumulator::new(3, Duration::from_secs(10));
        window.add(1);
        window.add(2);
        assert!(!window.should_flush());
        window.add(3);
        assert!(window.should_flush());
        assert_eq!(window.flush(), vec![1, 2, 3]);
        assert!(window.is_empty());
        assert!(!window.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_age_even_when_empty() {
        let mut window: WindowAccumulator<u8> = WindowAccumulator::new(10, Duration::from_secs(5));
        assert_eq!(window.remaining(), Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!window.should_flush());
        assert_eq!(window.remaining(), Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(window.is_expired());
        assert!(window.flush().is_empty());
        assert!(!window.is_expired());
    }

    #[test]
    fn test_seven_items_make_three_windows() {
        let mut window = WindowAccumulator::new(3, Duration::from_secs(5));
        let mut sizes = Vec::new();
        for i in 0..7 {
            window.add(i);
            if window.should_flush() {
                sizes.push(window.flush().len());
            }
        }
        sizes.push(window.flush().len());
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn test_restore_and_discard() {
        let mut window = WindowAccumulator::new(5, Duration::from_secs(5));
        window.add(1);
        window.add(2);
        let failed = window.flush();
        window.add(3);
        window.restore(failed);
        assert_eq!(window.items(), &[1, 2, 3]);
        assert_eq!(window.len(), 3);
        assert_eq!(window.discard(), 3);
        assert!(window.is_empty());
    }
}
