//! Stream client accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use uuid::Uuid;

use crate::clock;

/// Options parsed from the `/stream` query string.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub key: Option<String>,
    pub extra_headers: bool,
    pub advance_headers: bool,
    pub dual_final_frames: bool,
}

/// Per-client counters shared between the client task and `/state`.
pub struct ClientStats {
    pub extra_headers: bool,
    pub advance_headers: bool,
    pub dual_final_frames: bool,
    fps_current: AtomicU32,
    fps_accum: AtomicU32,
    fps_second: AtomicU64,
}

impl ClientStats {
    fn new(options: &StreamOptions) -> Self {
        Self {
            extra_headers: options.extra_headers,
            advance_headers: options.advance_headers,
            dual_final_frames: options.dual_final_frames,
            fps_current: AtomicU32::new(0),
            fps_accum: AtomicU32::new(0),
            fps_second: AtomicU64::new(0),
        }
    }

    /// Counts one sent frame, publishing the rate once per second.
    pub fn bump(&self) {
        let second = clock::floor_second(clock::now_monotonic()) as u64;
        if self.fps_second.swap(second, Ordering::Relaxed) != second {
            let accum = self.fps_accum.swap(0, Ordering::Relaxed);
            self.fps_current.store(accum, Ordering::Relaxed);
        }
        self.fps_accum.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fps(&self) -> u32 {
        self.fps_current.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Serialize)]
pub struct ClientStatEntry {
    pub fps: u32,
    pub extra_headers: bool,
    pub advance_headers: bool,
    pub dual_final_frames: bool,
}

/// Registry of connected `/stream` clients, keyed by their UUID.
///
/// Kept as a map rather than a linked list so ownership stays linear; only
/// the HTTP thread registers and unregisters.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<Uuid, Arc<ClientStats>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, options: &StreamOptions) -> (Uuid, Arc<ClientStats>) {
        let id = Uuid::new_v4();
        let stats = Arc::new(ClientStats::new(options));
        self.clients
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&stats));
        (id, stats)
    }

    pub fn unregister(&self, id: &Uuid) {
        self.clients.lock().unwrap().remove(id);
    }

    pub fn count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn stat_entries(&self) -> HashMap<String, ClientStatEntry> {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .map(|(id, stats)| {
                (
                    id.to_string(),
                    ClientStatEntry {
                        fps: stats.fps(),
                        extra_headers: stats.extra_headers,
                        advance_headers: stats.advance_headers,
                        dual_final_frames: stats.dual_final_frames,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let registry = ClientRegistry::new();
        assert_eq!(registry.count(), 0);

        let (id1, _stats1) = registry.register(&StreamOptions::default());
        let (id2, _stats2) = registry.register(&StreamOptions {
            extra_headers: true,
            ..Default::default()
        });
        assert_eq!(registry.count(), 2);
        assert_ne!(id1, id2);

        let entries = registry.stat_entries();
        assert!(entries[&id2.to_string()].extra_headers);

        registry.unregister(&id1);
        assert_eq!(registry.count(), 1);
        registry.unregister(&id2);
        assert_eq!(registry.count(), 0);
    }
}
