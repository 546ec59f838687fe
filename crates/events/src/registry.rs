//! Subscriber registry: event name -> ordered subscriber list.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use fanout_core::SubscriberId;

use crate::subscriber::{SubscriberDescriptor, Topic};

/// Append-only mapping from topic to subscribers.
///
/// - Owned by the service instance and shared with the processor via `Arc`.
/// - Registration takes the write lock; resolution clones the lists under the
///   read lock, so an in-flight resolve never sees a half-applied registration.
/// - There is no removal.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<Topic, Vec<SubscriberDescriptor>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber to the list for `topic`.
    ///
    /// Returns the subscriber's id, if it was registered with one.
    pub fn register(
        &self,
        topic: impl Into<Topic>,
        descriptor: SubscriberDescriptor,
    ) -> Option<SubscriberId> {
        let topic = topic.into();
        let id = descriptor.id().cloned();

        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subs.entry(topic).or_default().push(descriptor);

        id
    }

    /// Subscribers for `event_name`: exact-name ones first, then wildcard ones,
    /// each group in registration order.
    pub fn resolve(&self, event_name: &str) -> Vec<SubscriberDescriptor> {
        let topic = Topic::from(event_name);
        let subs = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut resolved = Vec::new();
        if topic != Topic::Wildcard {
            if let Some(named) = subs.get(&topic) {
                resolved.extend(named.iter().cloned());
            }
        }
        if let Some(wildcard) = subs.get(&Topic::Wildcard) {
            resolved.extend(wildcard.iter().cloned());
        }

        resolved
    }

    /// Number of subscribers registered under exactly `event_name`.
    pub fn subscriber_count(&self, event_name: &str) -> usize {
        let subs = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        subs.get(&Topic::from(event_name)).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use serde_json::json;

    use super::*;
    use crate::subscriber::subscriber_fn;

    fn named(id: &str) -> SubscriberDescriptor {
        SubscriberDescriptor::with_id(id, subscriber_fn(|_, _| async { Ok(json!(null)) }))
    }

    fn ids(resolved: &[SubscriberDescriptor]) -> Vec<Option<&str>> {
        resolved.iter().map(|d| d.id().map(|i| i.as_str())).collect()
    }

    #[test]
    fn exact_subscribers_come_before_wildcard_ones() {
        let registry = SubscriberRegistry::new();
        registry.register("*", named("audit"));
        registry.register("order.created", named("mailer"));
        registry.register("*", named("metrics"));
        registry.register("order.created", named("ledger"));

        let resolved = registry.resolve("order.created");

        assert_eq!(
            ids(&resolved),
            vec![Some("mailer"), Some("ledger"), Some("audit"), Some("metrics")]
        );
    }

    #[test]
    fn unknown_event_resolves_to_wildcard_only() {
        let registry = SubscriberRegistry::new();
        registry.register("order.created", named("mailer"));
        registry.register("*", named("audit"));

        assert_eq!(ids(&registry.resolve("order.cancelled")), vec![Some("audit")]);
    }

    #[test]
    fn register_returns_id_when_present() {
        let registry = SubscriberRegistry::new();
        let anonymous =
            SubscriberDescriptor::new(subscriber_fn(|_, _| async { Ok(json!(null)) }));

        assert_eq!(registry.register("a", named("x")), Some(SubscriberId::new("x")));
        assert_eq!(registry.register("a", anonymous), None);
        assert_eq!(registry.subscriber_count("a"), 2);
    }

    #[test]
    fn concurrent_registration_and_resolution() {
        let registry = Arc::new(SubscriberRegistry::new());

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        registry.register("order.created", named(&format!("w{w}-{i}")));
                    }
                })
            })
            .collect();

        let reader = {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let resolved = registry.resolve("order.created");
                    assert!(resolved.iter().all(|d| d.id().is_some()));
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();

        assert_eq!(registry.resolve("order.created").len(), 200);
    }
}
