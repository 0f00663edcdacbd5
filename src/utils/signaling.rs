//! Observer utility used to notify interested parties of an event
//!
//! A [`Signaler`] keeps a list of callbacks. Each registration returns a [`HookId`]
//! which can later be used to remove the callback again. Callbacks may safely
//! register or unregister hooks on the same signaler while an event is dispatched.

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

crate::utils::ids::id_gen!(hooks_id);

/// Unique hook identifier used to unregister a callback from a [`Signaler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(usize);

type Callback<E> = Rc<RefCell<dyn FnMut(&E)>>;

struct SignalerInner<E> {
    hooks: RefCell<Vec<(HookId, Callback<E>)>>,
}

/// A list of callbacks notified every time an event is sent
pub struct Signaler<E> {
    inner: Rc<SignalerInner<E>>,
}

impl<E> fmt::Debug for Signaler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signaler")
            .field("hooks", &self.inner.hooks.borrow().len())
            .finish()
    }
}

impl<E> Clone for Signaler<E> {
    fn clone(&self) -> Signaler<E> {
        Signaler {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for Signaler<E> {
    fn default() -> Self {
        Signaler::new()
    }
}

impl<E> Signaler<E> {
    /// Create a new signaler without any registered callback
    pub fn new() -> Signaler<E> {
        Signaler {
            inner: Rc::new(SignalerInner {
                hooks: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Register a callback invoked for every event sent through this signaler
    pub fn register<F: FnMut(&E) + 'static>(&self, f: F) -> HookId {
        let id = HookId(hooks_id::next());
        self.inner.hooks.borrow_mut().push((id, Rc::new(RefCell::new(f))));
        id
    }

    /// Remove a previously registered callback
    ///
    /// Returns `false` if no callback with this id was registered.
    pub fn unregister(&self, id: HookId) -> bool {
        let mut hooks = self.inner.hooks.borrow_mut();
        let len = hooks.len();
        hooks.retain(|(hook, _)| *hook != id);
        hooks.len() != len
    }

    /// Number of callbacks currently registered
    pub fn len(&self) -> usize {
        self.inner.hooks.borrow().len()
    }

    /// Returns true if no callback is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send an event to every registered callback
    pub fn send_event(&self, event: &E) {
        let snapshot = self.inner.hooks.borrow().clone();
        for (id, cb) in snapshot {
            // skip hooks removed by an earlier callback of this dispatch
            if !self.inner.hooks.borrow().iter().any(|(hook, _)| *hook == id) {
                continue;
            }
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb(event);
            }
        }
    }

    /// Create a weak handle to this signaler
    pub fn downgrade(&self) -> WeakSignaler<E> {
        WeakSignaler {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

/// Weak handle to a [`Signaler`]
pub struct WeakSignaler<E> {
    inner: Weak<SignalerInner<E>>,
}

impl<E> fmt::Debug for WeakSignaler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakSignaler").finish_non_exhaustive()
    }
}

impl<E> Clone for WeakSignaler<E> {
    fn clone(&self) -> Self {
        WeakSignaler {
            inner: self.inner.clone(),
        }
    }
}

impl<E> WeakSignaler<E> {
    /// Try to get a strong handle to the signaler
    pub fn upgrade(&self) -> Option<Signaler<E>> {
        self.inner.upgrade().map(|inner| Signaler { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::Signaler;
    use std::{cell::Cell, rc::Rc};

    #[test]
    fn unregister_stops_delivery() {
        let signaler = Signaler::<u32>::new();
        let seen = Rc::new(Cell::new(0));

        let seen2 = seen.clone();
        let id = signaler.register(move |v| seen2.set(seen2.get() + *v));
        signaler.send_event(&3);
        assert!(signaler.unregister(id));
        assert!(!signaler.unregister(id));
        signaler.send_event(&3);

        assert_eq!(seen.get(), 3);
        assert!(signaler.is_empty());
    }

    #[test]
    fn callback_may_unregister_others() {
        let signaler = Signaler::<()>::new();
        let fired = Rc::new(Cell::new(0));

        let victim = Rc::new(Cell::new(None));
        let (sig, v) = (signaler.clone(), victim.clone());
        signaler.register(move |_| {
            if let Some(id) = v.take() {
                sig.unregister(id);
            }
        });
        let fired2 = fired.clone();
        victim.set(Some(signaler.register(move |_| fired2.set(fired2.get() + 1))));

        signaler.send_event(&());
        assert_eq!(fired.get(), 0);
        assert_eq!(signaler.len(), 1);
    }
}
