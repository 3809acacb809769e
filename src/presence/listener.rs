use std::fmt;
use std::sync::Arc;

/// Callback fired when a device's presence stops being owned by the local
/// process.
///
/// The argument is `connected_elsewhere`: true when the displacement was
/// learned from the store's notification channel (a newer connection took
/// the device over, or the record was deleted or expired out from under
/// us), false when the same process replaced the connection itself.
///
/// Clones share identity. `same_listener` is part of the contract: a
/// connection teardown may only clear registry state still owned by the
/// exact listener it registered.
#[derive(Clone)]
pub struct DisplacedPresenceListener {
    inner: Arc<dyn Fn(bool) + Send + Sync>,
}

impl DisplacedPresenceListener {
    pub fn new(f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn notify(&self, connected_elsewhere: bool) {
        (self.inner)(connected_elsewhere);
    }

    pub fn same_listener(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DisplacedPresenceListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DisplacedPresenceListener")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn clones_share_identity() {
        let listener = DisplacedPresenceListener::new(|_| {});
        let clone = listener.clone();
        assert!(listener.same_listener(&clone));

        let other = DisplacedPresenceListener::new(|_| {});
        assert!(!listener.same_listener(&other));
    }

    #[test]
    fn notify_passes_the_flag_through() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let listener = DisplacedPresenceListener::new(move |elsewhere| {
            seen.fetch_add(if elsewhere { 10 } else { 1 }, Ordering::SeqCst);
        });
        listener.notify(false);
        listener.notify(true);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }
}
