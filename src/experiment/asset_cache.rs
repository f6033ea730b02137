//! Ordered queue of pending asset documents.
//!
//! The detector pushes documents as they are composed; the collaborator that forwards
//! them into the event stream drains the queue. Clones share one queue, so the forwarder
//! may hold its own handle.

use crate::experiment::document::{AssetDocument, DatumDoc, ResourceDoc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Shared FIFO of `(kind, document)` entries.
///
/// Only pending entries are held. Ordering is the producer's: the detector queues a
/// session's resource at stage, before any trigger can queue a datum for it.
#[derive(Debug, Clone, Default)]
pub struct AssetCache {
    queue: Arc<Mutex<VecDeque<AssetDocument>>>,
}

impl AssetCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a resource document.
    pub fn push_resource(&self, resource: ResourceDoc) {
        self.queue.lock().push_back(AssetDocument::Resource(resource));
    }

    /// Queues a datum document behind everything already pending.
    pub fn push_datum(&self, datum: DatumDoc) {
        self.queue.lock().push_back(AssetDocument::Datum(datum));
    }

    /// Removes and returns every pending entry, oldest first.
    pub fn drain(&self) -> Vec<AssetDocument> {
        std::mem::take(&mut *self.queue.lock()).into()
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::composer::AssetComposer;
    use crate::experiment::document::AssetKind;
    use std::collections::HashMap;

    #[test]
    fn test_drain_preserves_order_and_empties() {
        let composer = AssetComposer::new("TEST");
        let cache = AssetCache::new();
        let res = composer.make_resource("/tmp", "a.frm", HashMap::new());
        cache.push_resource(res.clone());
        cache.push_datum(composer.make_datum(&res, 0));
        cache.push_datum(composer.make_datum(&res, 1));

        let docs = cache.drain();
        let kinds: Vec<AssetKind> = docs.iter().map(AssetDocument::kind).collect();
        assert_eq!(
            kinds,
            vec![AssetKind::Resource, AssetKind::Datum, AssetKind::Datum]
        );
        assert!(cache.is_empty());
        assert!(cache.drain().is_empty());
    }

    #[test]
    fn test_drained_sessions_leave_nothing_behind() {
        let composer = AssetComposer::new("TEST");
        let cache = AssetCache::new();
        for session in 0..100 {
            let res = composer.make_resource("/tmp", format!("{session}.frm"), HashMap::new());
            cache.push_resource(res.clone());
            cache.push_datum(composer.make_datum(&res, 0));
            assert_eq!(cache.drain().len(), 2);
        }
        assert!(cache.is_empty());
        assert_eq!(cache.queue.lock().capacity(), 0);
    }

    #[test]
    fn test_datum_after_resource_was_drained() {
        let composer = AssetComposer::new("TEST");
        let cache = AssetCache::new();
        let res = composer.make_resource("/tmp", "a.frm", HashMap::new());
        cache.push_resource(res.clone());
        assert_eq!(cache.drain().len(), 1);

        cache.push_datum(composer.make_datum(&res, 0));
        let docs = cache.drain();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].kind(), AssetKind::Datum);
    }

    #[test]
    fn test_clones_share_queue() {
        let composer = AssetComposer::new("TEST");
        let cache = AssetCache::new();
        let forwarder = cache.clone();
        cache.push_resource(composer.make_resource("/tmp", "a.frm", HashMap::new()));
        assert_eq!(forwarder.drain().len(), 1);
        assert!(cache.is_empty());
    }
}
