//! Handler registry
//!
//! Holds the lifecycle slots and named event handlers. Only the dispatcher
//! task touches the registry, so callbacks need `Send` but not `Sync`.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use peerkit_core::{EventEnvelope, PeerIdentity};
use smallvec::SmallVec;
use tracing::{debug, error};

use super::{
    EventHandler, GeneralHandler, HandlerId, LifecycleCallback, LifecycleSlot, PeerCallback,
    ResourceFinishedCallback, UnhandledCallback,
};

/// What happened to one dispatched envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchOutcome {
    /// The general handler ran
    pub general: bool,
    /// Number of named handlers that ran
    pub named: usize,
    /// The unhandled slot ran
    pub unhandled: bool,
}

/// Run an application callback, containing any panic so the dispatcher
/// survives it. Returns false if the callback panicked.
pub(crate) fn guarded<F: FnOnce()>(what: &str, callback: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(()) => true,
        Err(_) => {
            error!("{} callback panicked, continuing", what);
            false
        }
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    on_connecting: Option<PeerCallback>,
    on_connected: Option<PeerCallback>,
    on_disconnected: Option<PeerCallback>,
    on_resource_finished: Option<ResourceFinishedCallback>,
    general: Option<GeneralHandler>,
    unhandled: Option<UnhandledCallback>,
    handlers: HashMap<String, SmallVec<[(HandlerId, EventHandler); 2]>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Fill a lifecycle slot, replacing any previous callback
    pub fn set_lifecycle(&mut self, callback: LifecycleCallback) {
        let slot = callback.slot();
        let replaced = match callback {
            LifecycleCallback::Connecting(cb) => self.on_connecting.replace(cb).is_some(),
            LifecycleCallback::Connected(cb) => self.on_connected.replace(cb).is_some(),
            LifecycleCallback::Disconnected(cb) => self.on_disconnected.replace(cb).is_some(),
            LifecycleCallback::ResourceFinished(cb) => {
                self.on_resource_finished.replace(cb).is_some()
            }
            LifecycleCallback::General(cb) => self.general.replace(cb).is_some(),
            LifecycleCallback::Unhandled(cb) => self.unhandled.replace(cb).is_some(),
        };
        if replaced {
            debug!("Replaced {:?} callback", slot);
        }
    }

    pub fn clear_lifecycle(&mut self, slot: LifecycleSlot) {
        match slot {
            LifecycleSlot::Connecting => self.on_connecting = None,
            LifecycleSlot::Connected => self.on_connected = None,
            LifecycleSlot::Disconnected => self.on_disconnected = None,
            LifecycleSlot::ResourceFinished => self.on_resource_finished = None,
            LifecycleSlot::General => self.general = None,
            LifecycleSlot::Unhandled => self.unhandled = None,
        }
    }

    /// Append a handler for `event`; earlier registrations run first
    pub fn register(&mut self, id: HandlerId, event: String, handler: EventHandler) {
        self.handlers.entry(event).or_default().push((id, handler));
    }

    /// Remove one handler; returns whether it existed
    pub fn unregister(&mut self, id: HandlerId) -> bool {
        let mut emptied = None;
        let mut found = false;
        for (event, handlers) in self.handlers.iter_mut() {
            if let Some(pos) = handlers.iter().position(|(hid, _)| *hid == id) {
                handlers.remove(pos);
                found = true;
                if handlers.is_empty() {
                    emptied = Some(event.clone());
                }
                break;
            }
        }
        if let Some(event) = emptied {
            self.handlers.remove(&event);
        }
        found
    }

    /// Remove every handler for `event`; returns how many were removed
    pub fn unregister_event(&mut self, event: &str) -> usize {
        self.handlers
            .remove(event)
            .map(|handlers| handlers.len())
            .unwrap_or(0)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(|handlers| handlers.len()).sum()
    }

    pub fn has_handlers(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    // ------------------------------------------------------------------------
    // Invocation
    // ------------------------------------------------------------------------

    pub fn notify_connecting(&mut self, local: &PeerIdentity, peer: &PeerIdentity) {
        if let Some(cb) = self.on_connecting.as_mut() {
            guarded("connecting", || cb(local, peer));
        }
    }

    pub fn notify_connected(&mut self, local: &PeerIdentity, peer: &PeerIdentity) {
        if let Some(cb) = self.on_connected.as_mut() {
            guarded("connect", || cb(local, peer));
        }
    }

    pub fn notify_disconnected(&mut self, local: &PeerIdentity, peer: &PeerIdentity) {
        if let Some(cb) = self.on_disconnected.as_mut() {
            guarded("disconnect", || cb(local, peer));
        }
    }

    pub fn notify_resource_finished(
        &mut self,
        local: &PeerIdentity,
        name: &str,
        from: &PeerIdentity,
        location: &Path,
    ) {
        if let Some(cb) = self.on_resource_finished.as_mut() {
            guarded("resource finished", || cb(local, name, from, location));
        }
    }

    /// Run the general handler, then named handlers in registration order,
    /// then the unhandled slot if no named handler exists
    pub fn dispatch(&mut self, from: &PeerIdentity, envelope: &EventEnvelope) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        if let Some(general) = self.general.as_mut() {
            guarded("general event", || {
                general(from, envelope.event_name(), envelope.payload())
            });
            outcome.general = true;
        }

        if let Some(handlers) = self.handlers.get_mut(envelope.event_name()) {
            for (_, handler) in handlers.iter_mut() {
                // a panicking handler still counts as having run
                guarded(envelope.event_name(), || handler(from, envelope.payload()));
                outcome.named += 1;
            }
        }

        if outcome.named == 0 {
            if let Some(unhandled) = self.unhandled.as_mut() {
                guarded("unhandled event", || unhandled(from, envelope));
                outcome.unhandled = true;
            } else {
                debug!("No handler for '{}' from {}", envelope.event_name(), from);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerkit_core::Payload;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn named(log: &Log, tag: &'static str) -> EventHandler {
        let log = log.clone();
        Box::new(move |_: &PeerIdentity, _: Option<&Payload>| {
            log.lock().unwrap().push(tag.to_string());
        })
    }

    fn envelope(name: &str) -> EventEnvelope {
        EventEnvelope::new(name, Some(Payload::Text("x".into()))).unwrap()
    }

    #[test]
    fn test_dispatch_order_general_then_named() {
        let log: Log = Arc::default();
        let mut registry = HandlerRegistry::new();
        let general_log = log.clone();
        registry.set_lifecycle(LifecycleCallback::General(Box::new(
            move |_: &PeerIdentity, name: &str, _: Option<&Payload>| {
                general_log.lock().unwrap().push(format!("general:{}", name));
            },
        )));
        registry.register(HandlerId(1), "hello".into(), named(&log, "first"));
        registry.register(HandlerId(2), "hello".into(), named(&log, "second"));

        let outcome = registry.dispatch(&PeerIdentity::new("p"), &envelope("hello"));
        assert_eq!(
            outcome,
            DispatchOutcome {
                general: true,
                named: 2,
                unhandled: false
            }
        );
        assert_eq!(*log.lock().unwrap(), vec!["general:hello", "first", "second"]);
    }

    #[test]
    fn test_handlers_are_isolated_by_name() {
        let log: Log = Arc::default();
        let mut registry = HandlerRegistry::new();
        registry.register(HandlerId(1), "foo".into(), named(&log, "foo"));

        let outcome = registry.dispatch(&PeerIdentity::new("p"), &envelope("bar"));
        assert_eq!(outcome.named, 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unhandled_slot_only_without_named_handler() {
        let log: Log = Arc::default();
        let mut registry = HandlerRegistry::new();
        let unhandled_log = log.clone();
        registry.set_lifecycle(LifecycleCallback::Unhandled(Box::new(
            move |_: &PeerIdentity, envelope: &EventEnvelope| {
                unhandled_log
                    .lock()
                    .unwrap()
                    .push(format!("unhandled:{}", envelope.event_name()));
            },
        )));
        registry.register(HandlerId(1), "known".into(), named(&log, "known"));

        registry.dispatch(&PeerIdentity::new("p"), &envelope("known"));
        registry.dispatch(&PeerIdentity::new("p"), &envelope("other"));
        assert_eq!(*log.lock().unwrap(), vec!["known", "unhandled:other"]);
    }

    #[test]
    fn test_unregister() {
        let log: Log = Arc::default();
        let mut registry = HandlerRegistry::new();
        registry.register(HandlerId(1), "a".into(), named(&log, "a1"));
        registry.register(HandlerId(2), "a".into(), named(&log, "a2"));
        registry.register(HandlerId(3), "b".into(), named(&log, "b"));
        assert_eq!(registry.handler_count(), 3);

        assert!(registry.unregister(HandlerId(1)));
        assert!(!registry.unregister(HandlerId(1)));
        registry.dispatch(&PeerIdentity::new("p"), &envelope("a"));
        assert_eq!(*log.lock().unwrap(), vec!["a2"]);

        assert_eq!(registry.unregister_event("a"), 1);
        assert!(!registry.has_handlers("a"));
        assert!(registry.unregister(HandlerId(3)));
        assert_eq!(registry.handler_count(), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_dispatch() {
        let log: Log = Arc::default();
        let mut registry = HandlerRegistry::new();
        registry.register(
            HandlerId(1),
            "boom".into(),
            Box::new(|_: &PeerIdentity, _: Option<&Payload>| panic!("handler exploded")),
        );
        registry.register(HandlerId(2), "boom".into(), named(&log, "after"));
        registry.set_lifecycle(LifecycleCallback::Connected(Box::new(
            |_: &PeerIdentity, _: &PeerIdentity| panic!("connect exploded"),
        )));

        let outcome = registry.dispatch(&PeerIdentity::new("p"), &envelope("boom"));
        assert_eq!(outcome.named, 2);
        registry.notify_connected(&PeerIdentity::new("me"), &PeerIdentity::new("p"));
        registry.dispatch(&PeerIdentity::new("p"), &envelope("boom"));
        assert_eq!(*log.lock().unwrap(), vec!["after", "after"]);
    }

    #[test]
    fn test_lifecycle_slots_replace_and_clear() {
        let log: Log = Arc::default();
        let mut registry = HandlerRegistry::new();
        for tag in ["old", "new"] {
            let log = log.clone();
            registry.set_lifecycle(LifecycleCallback::Connected(Box::new(
                move |_: &PeerIdentity, _: &PeerIdentity| log.lock().unwrap().push(tag.to_string()),
            )));
        }
        let (me, peer) = (PeerIdentity::new("me"), PeerIdentity::new("peer"));
        registry.notify_connected(&me, &peer);
        registry.clear_lifecycle(LifecycleSlot::Connected);
        registry.notify_connected(&me, &peer);
        assert_eq!(*log.lock().unwrap(), vec!["new"]);
    }
}
