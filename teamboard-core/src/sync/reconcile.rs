/// Local copy of one collection: what the store last confirmed and what the
/// user currently sees while a write is in flight.
use crate::types::Item;

/// Sequence to render. While a write is in flight the optimistic sequence
/// wins; otherwise the store's confirmed state does.
pub fn reconcile<'a, T>(
    confirmed: &'a [Item<T>],
    optimistic: Option<&'a [Item<T>]>,
    in_flight: bool,
) -> &'a [Item<T>] {
    match optimistic {
        Some(optimistic) if in_flight => optimistic,
        _ => confirmed,
    }
}

#[derive(Debug, Clone)]
pub struct CollectionCell<T> {
    confirmed: Vec<Item<T>>,
    optimistic: Option<Vec<Item<T>>>,
    in_flight: usize,
    /// A notification that was not our own echo arrived during the write
    foreign_during_write: bool,
}

impl<T> Default for CollectionCell<T> {
    fn default() -> Self {
        Self {
            confirmed: Vec::new(),
            optimistic: None,
            in_flight: 0,
            foreign_during_write: false,
        }
    }
}

impl<T: Clone> CollectionCell<T> {
    pub fn new(confirmed: Vec<Item<T>>) -> Self {
        Self {
            confirmed,
            ..Self::default()
        }
    }

    pub fn confirmed(&self) -> &[Item<T>] {
        &self.confirmed
    }

    pub fn displayed(&self) -> &[Item<T>] {
        reconcile(&self.confirmed, self.optimistic.as_deref(), self.in_flight > 0)
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight > 0
    }

    /// Record a local write and show its expected result.
    pub fn begin_write(&mut self, optimistic: Vec<Item<T>>) {
        if self.in_flight == 0 {
            self.foreign_during_write = false;
        }
        self.in_flight += 1;
        self.optimistic = Some(optimistic);
    }

    /// A remote snapshot always becomes the confirmed state. `is_echo` marks
    /// notifications produced by our own pending write.
    pub fn on_remote(&mut self, items: Vec<Item<T>>, is_echo: bool) {
        if self.in_flight > 0 && !is_echo {
            self.foreign_during_write = true;
        }
        self.confirmed = items;
    }

    /// One write finished. A failure drops the optimistic view right away.
    /// When the last write succeeds and nobody else wrote meanwhile, the
    /// optimistic sequence is taken as confirmed until the echo arrives.
    pub fn settle(&mut self, success: bool) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if !success {
            self.optimistic = None;
        }
        if self.in_flight == 0 {
            if let Some(optimistic) = self.optimistic.take() {
                if !self.foreign_during_write {
                    self.confirmed = optimistic;
                }
            }
            self.foreign_during_write = false;
        }
    }

    /// Forget everything pending, as on dispose.
    pub fn release(&mut self) {
        self.optimistic = None;
        self.in_flight = 0;
        self.foreign_during_write = false;
    }
}
