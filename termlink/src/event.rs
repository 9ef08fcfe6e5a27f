use std::fmt;
use std::sync::{Arc, Mutex, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    next_id: u64,
    subscribers: Vec<(u64, Callback<T>)>,
}

/// Synchronous publish/subscribe primitive.
///
/// Callbacks run on the notifying task and must not call back into the
/// manager. The subscriber list is copied before dispatch, so a callback
/// may unsubscribe (itself or others) while a notification is in flight.
pub struct Event<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription<T> {
        let mut slots = self.slots.lock().unwrap();
        let id = slots.next_id;
        slots.next_id += 1;
        slots.subscribers.push((id, Arc::new(callback)));

        Subscription {
            slots: Arc::downgrade(&self.slots),
            id,
        }
    }

    pub fn notify(&self, argument: &T) {
        let callbacks: Vec<Callback<T>> = {
            let slots = self.slots.lock().unwrap();
            slots
                .subscribers
                .iter()
                .map(|(_, callback)| callback.clone())
                .collect()
        };

        for callback in callbacks {
            callback(argument);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.lock().unwrap().subscribers.len()
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Cloning a sensor or command must not share subscriber lists between the
// copies, so a clone starts out empty.
impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle returned by [`Event::subscribe`]; detaches the callback.
pub struct Subscription<T> {
    slots: Weak<Mutex<Slots<T>>>,
    id: u64,
}

impl<T> Subscription<T> {
    pub fn unsubscribe(self) {
        if let Some(slots) = self.slots.upgrade() {
            let mut slots = slots.lock().unwrap();
            slots.subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_notify_reaches_all_subscribers() {
        let event: Event<u32> = Event::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            event.subscribe(move |value| {
                count.fetch_add(*value as usize, Ordering::SeqCst);
            });
        }

        event.notify(&2);
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_unsubscribe() {
        let event: Event<()> = Event::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        let subscription = event.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        event.notify(&());
        subscription.unsubscribe();
        event.notify(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clone_resets_subscribers() {
        let event: Event<()> = Event::new();
        event.subscribe(|_| {});

        let copy = event.clone();
        assert_eq!(event.subscriber_count(), 1);
        assert_eq!(copy.subscriber_count(), 0);
    }
}
