/// Listener registry shared by the buffer and the marker store.
///
/// Handlers receive events by reference and cannot reach back into the
/// emitting component, so emission never interleaves with an edit.
pub struct Emitter<T> {
    next_id: u64,
    handlers: Vec<(SubscriptionId, Box<dyn FnMut(&T)>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            handlers: Vec::new(),
        }
    }
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&T) + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.handlers.push((id, Box::new(handler)));
        id
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(handler_id, _)| *handler_id != id);
        self.handlers.len() != before
    }

    pub fn emit(&mut self, event: &T) {
        for (_, handler) in &mut self.handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_emit_reaches_every_subscriber() {
        let mut emitter = Emitter::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let first = seen.clone();
        emitter.subscribe(move |value: &u32| first.borrow_mut().push(*value));
        let second = seen.clone();
        emitter.subscribe(move |value: &u32| second.borrow_mut().push(value * 10));

        emitter.emit(&3);
        assert_eq!(*seen.borrow(), vec![3, 30]);
    }

    #[test]
    fn test_unsubscribe() {
        let mut emitter = Emitter::new();
        let count = Rc::new(RefCell::new(0));
        let counter = count.clone();
        let id = emitter.subscribe(move |_: &()| *counter.borrow_mut() += 1);

        emitter.emit(&());
        assert!(emitter.unsubscribe(id));
        assert!(!emitter.unsubscribe(id));
        emitter.emit(&());

        assert_eq!(*count.borrow(), 1);
        assert!(emitter.is_empty());
    }
}
