//! Per-sub-device push subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use aqara_protocol::{Frame, Payload};

/// Callback invoked with the decoded attributes and the raw frame.
pub type PushCallback = Arc<dyn Fn(&Payload, &Frame) + Send + Sync>;

/// Handle returned by [`Subscriptions::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Callbacks registered per sub-device sid.
///
/// Dispatch clones the callback list out of the lock, so callbacks may
/// subscribe or unsubscribe without deadlocking.
#[derive(Default)]
pub struct Subscriptions {
    next_id: AtomicU64,
    callbacks: RwLock<HashMap<String, Vec<(SubscriptionId, PushCallback)>>>,
    /// Invoked for sids nobody subscribed to.
    fallback: RwLock<Option<PushCallback>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for pushes addressed to `sid`.
    pub fn subscribe(&self, sid: impl Into<String>, callback: PushCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(sid.into())
            .or_default()
            .push((id, callback));
        id
    }

    /// Removes a subscription. Returns `true` if it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut map = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        map.retain(|_, list| {
            let before = list.len();
            list.retain(|(sub, _)| *sub != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Sets the callback for pushes from sids without a subscriber.
    pub fn set_fallback(&self, callback: PushCallback) {
        *self.fallback.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Invokes every callback registered for `sid`, or the fallback if
    /// there are none. Returns how many ran.
    pub fn dispatch(&self, sid: &str, payload: &Payload, raw: &Frame) -> usize {
        let callbacks: Vec<PushCallback> = {
            let map = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
            match map.get(sid) {
                Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => Vec::new(),
            }
        };
        let callbacks = if callbacks.is_empty() {
            let fallback = self.fallback.read().unwrap_or_else(PoisonError::into_inner);
            fallback.iter().cloned().collect()
        } else {
            callbacks
        };

        for cb in &callbacks {
            cb(payload, raw);
        }
        callbacks.len()
    }

    /// Number of callbacks registered for `sid`.
    pub fn count(&self, sid: &str) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sid)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn payload(status: &str) -> Payload {
        let mut p = Payload::new();
        p.insert("status".into(), status.into());
        p
    }

    #[test]
    fn dispatch_reaches_all_subscribers_of_sid() {
        let subs = Subscriptions::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = seen.clone();
            subs.subscribe(
                "158d0001a2b3c4",
                Arc::new(move |p: &Payload, _raw: &Frame| {
                    seen.lock().unwrap().push(format!("{tag}:{}", p["status"]));
                }),
            );
        }
        subs.subscribe("other", Arc::new(|_: &Payload, _: &Frame| panic!("wrong sid")));

        let ran = subs.dispatch("158d0001a2b3c4", &payload("on"), &Frame::new("report"));
        assert_eq!(ran, 2);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&"a:\"on\"".to_string()));
    }

    #[test]
    fn dispatch_unknown_sid_is_noop() {
        let subs = Subscriptions::new();
        assert_eq!(subs.dispatch("nobody", &payload("on"), &Frame::new("report")), 0);
    }

    #[test]
    fn fallback_runs_only_without_subscriber() {
        let subs = Subscriptions::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        subs.set_fallback(Arc::new(move |_: &Payload, raw: &Frame| {
            s.lock().unwrap().push(raw.sid.clone().unwrap_or_default());
        }));
        subs.subscribe("known", Arc::new(|_: &Payload, _: &Frame| {}));

        assert_eq!(
            subs.dispatch("known", &payload("on"), &Frame::for_sid("report", "known")),
            1
        );
        assert_eq!(
            subs.dispatch("new", &payload("on"), &Frame::for_sid("report", "new")),
            1
        );
        assert_eq!(*seen.lock().unwrap(), vec!["new".to_string()]);
    }

    #[test]
    fn unsubscribe_removes_only_that_callback() {
        let subs = Subscriptions::new();
        let first = subs.subscribe("s1", Arc::new(|_: &Payload, _: &Frame| {}));
        subs.subscribe("s1", Arc::new(|_: &Payload, _: &Frame| {}));

        assert!(subs.unsubscribe(first));
        assert!(!subs.unsubscribe(first));
        assert_eq!(subs.count("s1"), 1);
    }

    #[test]
    fn callback_may_subscribe_during_dispatch() {
        let subs = Arc::new(Subscriptions::new());
        let inner = subs.clone();
        subs.subscribe(
            "s1",
            Arc::new(move |_: &Payload, _: &Frame| {
                inner.subscribe("s2", Arc::new(|_: &Payload, _: &Frame| {}));
            }),
        );

        subs.dispatch("s1", &payload("on"), &Frame::new("report"));
        assert_eq!(subs.count("s2"), 1);
    }
}
