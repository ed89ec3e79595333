//! Multi-listener event fan-out.
//!
//! Every component publishes through an [`Emitter`]. Listeners hold a
//! [`Subscription`] and are unregistered when it is dropped, so teardown is
//! deterministic: drop the handles and nothing keeps firing into a stale
//! consumer. Delivery is unbounded and in emission order per listener.

use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

struct Listeners<E> {
    next_id: u64,
    senders: Vec<(u64, mpsc::UnboundedSender<E>)>,
}

pub struct Emitter<E> {
    listeners: Arc<Mutex<Listeners<E>>>,
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<E: Clone> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> Emitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                senders: Vec::new(),
            })),
        }
    }

    /// Register a listener. Events emitted after this call are delivered to
    /// the returned handle until it is dropped.
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = match self.listeners.lock() {
            Ok(mut guard) => {
                guard.next_id += 1;
                let id = guard.next_id;
                guard.senders.push((id, tx));
                id
            }
            Err(_) => 0,
        };
        Subscription {
            id,
            rx,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn emit(&self, event: E) {
        if let Ok(mut guard) = self.listeners.lock() {
            guard
                .senders
                .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .map(|guard| guard.senders.len())
            .unwrap_or(0)
    }
}

/// Receiving end of one listener registration.
pub struct Subscription<E> {
    id: u64,
    rx: mpsc::UnboundedReceiver<E>,
    listeners: Weak<Mutex<Listeners<E>>>,
}

impl<E> Subscription<E> {
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            if let Ok(mut guard) = listeners.lock() {
                guard.senders.retain(|(id, _)| *id != self.id);
            }
        }
    }
}
