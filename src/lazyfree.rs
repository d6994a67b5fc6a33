//! Background reclaimer for asynchronous deletion.
//!
//! UNLINK and the ASYNC flush variants detach payloads from the keyspace
//! on the main thread and hand them over a channel; a dedicated thread
//! drops them. The reclaimer never observes live server structures; it
//! owns what it receives outright.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use tracing::debug;

use crate::dict::Dict;
use crate::object::Object;

#[derive(Debug)]
pub enum Reclaim {
    Object(Arc<Object>),
    Keyspace {
        entries: Dict<Arc<Object>>,
        expires: Dict<u64>,
    },
}

#[derive(Debug)]
pub struct LazyFree {
    tx: Option<Sender<Reclaim>>,
    freed: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl LazyFree {
    pub fn spawn() -> Self {
        let (tx, rx) = unbounded::<Reclaim>();
        let freed = Arc::new(AtomicU64::new(0));
        let counter = freed.clone();
        let handle = std::thread::Builder::new()
            .name("lazyfree".to_string())
            .spawn(move || {
                while let Ok(item) = rx.recv() {
                    drop(item);
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                debug!("lazyfree thread exiting");
            })
            .expect("failed to spawn lazyfree thread");
        LazyFree {
            tx: Some(tx),
            freed,
            handle: Some(handle),
        }
    }

    /// Queue a payload for background dropping. Falls back to an inline
    /// drop if the reclaimer is gone.
    pub fn enqueue(&self, item: Reclaim) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.send(item) {
                drop(e.into_inner());
            }
        }
    }

    /// Total payloads reclaimed so far.
    pub fn freed_count(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }
}

impl Drop for LazyFree {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain and exit.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
