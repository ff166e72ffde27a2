use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use slotmap::SlotMap;

use crate::notify_manager::NotifyManager;

slotmap::new_key_type! {
    /// Handle returned when subscribing to an environment signal.
    pub struct SignalKey;
}

/// A boolean environment flag with change listeners.
#[derive(Clone)]
struct SignalState {
    value: Rc<Cell<bool>>,
    listeners: Rc<RefCell<SlotMap<SignalKey, Rc<dyn Fn(bool)>>>>,
}

impl SignalState {
    fn new(value: bool) -> Self {
        Self {
            value: Rc::new(Cell::new(value)),
            listeners: Rc::new(RefCell::new(SlotMap::with_key())),
        }
    }

    fn set(&self, value: bool) -> bool {
        if self.value.replace(value) == value {
            return false;
        }
        let listeners: Vec<_> = self.listeners.borrow().values().cloned().collect();
        for listener in listeners {
            listener(value);
        }
        true
    }

    fn subscribe(&self, listener: impl Fn(bool) + 'static) -> SignalKey {
        self.listeners.borrow_mut().insert(Rc::new(listener))
    }

    fn unsubscribe(&self, key: SignalKey) -> bool {
        self.listeners.borrow_mut().remove(key).is_some()
    }
}

/// Connectivity as reported by the embedding environment.
///
/// The engine never probes the network; the host calls [`set_online`](Self::set_online).
#[derive(Clone)]
pub struct OnlineManager(SignalState);

impl Default for OnlineManager {
    fn default() -> Self {
        OnlineManager(SignalState::new(true))
    }
}

impl OnlineManager {
    /// Whether the environment is online.
    pub fn is_online(&self) -> bool {
        self.0.value.get()
    }

    /// Reports a connectivity change. Listeners only run when the value changes.
    pub fn set_online(&self, online: bool) {
        if self.0.set(online) {
            tracing::debug!(online, "connectivity changed");
        }
    }

    /// Listens for connectivity changes.
    pub fn subscribe(&self, listener: impl Fn(bool) + 'static) -> SignalKey {
        self.0.subscribe(listener)
    }

    /// Removes a listener.
    pub fn unsubscribe(&self, key: SignalKey) -> bool {
        self.0.unsubscribe(key)
    }
}

/// Window/app focus as reported by the embedding environment.
#[derive(Clone)]
pub struct FocusManager(SignalState);

impl Default for FocusManager {
    fn default() -> Self {
        FocusManager(SignalState::new(true))
    }
}

impl FocusManager {
    /// Whether the app is focused.
    pub fn is_focused(&self) -> bool {
        self.0.value.get()
    }

    /// Reports a focus change. Listeners only run when the value changes.
    pub fn set_focused(&self, focused: bool) {
        if self.0.set(focused) {
            tracing::debug!(focused, "focus changed");
        }
    }

    /// Listens for focus changes.
    pub fn subscribe(&self, listener: impl Fn(bool) + 'static) -> SignalKey {
        self.0.subscribe(listener)
    }

    /// Removes a listener.
    pub fn unsubscribe(&self, key: SignalKey) -> bool {
        self.0.unsubscribe(key)
    }
}

/// Managers shared by a client and both of its caches.
#[derive(Clone, Default)]
pub struct Environment {
    /// Notification batcher.
    pub notify: NotifyManager,
    /// Connectivity signal.
    pub online: OnlineManager,
    /// Focus signal.
    pub focus: FocusManager,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_run_on_change_only() {
        let online = OnlineManager::default();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let key = online.subscribe(move |value| s.borrow_mut().push(value));

        online.set_online(true);
        online.set_online(false);
        online.set_online(false);
        online.set_online(true);
        assert_eq!(*seen.borrow(), vec![false, true]);

        assert!(online.unsubscribe(key));
        online.set_online(false);
        assert_eq!(seen.borrow().len(), 2);
        assert!(!online.is_online());
    }

    #[test]
    fn focus_defaults_to_focused() {
        let focus = FocusManager::default();
        assert!(focus.is_focused());
        focus.set_focused(false);
        assert!(!focus.is_focused());
    }
}
