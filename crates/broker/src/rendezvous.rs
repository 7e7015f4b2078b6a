//! Correlates an outstanding `Connect` request with the dial-back connection
//! that eventually answers it.
//!
//! Ids are assigned by the server, never by the (untrusted) device, so there
//! is never ambiguity about which dial-back answers which request: a
//! monotonic counter plus a single-shot slot per id.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// How long `open_stream` waits for a dial-back before giving up.
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum WaitError {
    /// No [`TcpStream`] arrived within [`RENDEZVOUS_TIMEOUT`].
    Timeout,
    /// The sending half was dropped without delivering a connection (the
    /// table itself was torn down).
    Cancelled,
}

struct Inner {
    next_id: AtomicU64,
    slots: Mutex<AHashMap<u64, oneshot::Sender<TcpStream>>>,
}

/// Shared handle to the rendezvous table. Cheaply cloneable.
#[derive(Clone)]
pub struct RendezvousTable {
    inner: Arc<Inner>,
}

impl Default for RendezvousTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RendezvousTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                slots: Mutex::new(AHashMap::new()),
            }),
        }
    }

    /// Allocate a fresh correlation id and the ticket the caller must hold
    /// for the lifetime of one `open_stream` call.
    pub fn allocate(&self) -> Ticket {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.inner.slots.lock().insert(id, tx);

        Ticket {
            table: self.inner.clone(),
            id,
            rx: Some(rx),
            released: false,
        }
    }

    /// Hand a dial-back connection to whichever `open_stream` call is
    /// awaiting `id`. If nobody is waiting (unknown or already-released id),
    /// `conn` is dropped (closing it).
    pub fn deliver(&self, id: u64, conn: TcpStream) {
        let sender = self.inner.slots.lock().remove(&id);
        match sender {
            Some(tx) => {
                // the receiver may have raced us into release(); either way
                // a failed send just closes `conn` when it drops.
                let _ = tx.send(conn);
            }
            None => log::debug!("no rendezvous awaiter for id {id}, closing dial-back"),
        }
    }
}

/// RAII guard returned by [`RendezvousTable::allocate`]. Releases its slot on
/// every exit path — success, timeout, or early drop from cancellation —
/// so a caller never has to remember to clean up by hand.
pub struct Ticket {
    table: Arc<Inner>,
    id: u64,
    rx: Option<oneshot::Receiver<TcpStream>>,
    released: bool,
}

impl Ticket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait up to [`RENDEZVOUS_TIMEOUT`] for the matching dial-back.
    pub async fn wait(mut self) -> Result<TcpStream, WaitError> {
        let rx = self.rx.take().expect("wait called twice");

        match timeout(RENDEZVOUS_TIMEOUT, rx).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(_)) => Err(WaitError::Cancelled),
            Err(_) => Err(WaitError::Timeout),
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.table.slots.lock().remove(&self.id);
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn dummy_conn() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let a = TcpStream::connect(addr).await.unwrap();
        accept.await.unwrap();
        a
    }

    #[tokio::test]
    async fn allocates_strictly_increasing_ids() {
        let table = RendezvousTable::new();
        let a = table.allocate();
        let b = table.allocate();
        assert!(b.id() > a.id());
    }

    #[tokio::test]
    async fn delivers_to_the_matching_awaiter() {
        let table = RendezvousTable::new();
        let ticket = table.allocate();
        let id = ticket.id();

        let conn = dummy_conn().await;
        table.deliver(id, conn);

        assert!(ticket.wait().await.is_ok());
    }

    #[tokio::test]
    async fn delivery_with_no_awaiter_is_dropped_silently() {
        let table = RendezvousTable::new();
        let conn = dummy_conn().await;
        // id 0 was never allocated.
        table.deliver(0, conn);
    }

    #[tokio::test]
    async fn delivery_after_release_is_dropped_silently() {
        let table = RendezvousTable::new();
        let ticket = table.allocate();
        let id = ticket.id();
        drop(ticket);

        let conn = dummy_conn().await;
        table.deliver(id, conn);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_and_releases_the_slot() {
        let table = RendezvousTable::new();
        let ticket = table.allocate();
        let id = ticket.id();

        let result = ticket.wait().await;
        assert!(matches!(result, Err(WaitError::Timeout)));

        // the slot must be gone after timeout: a late delivery finds nobody.
        let conn = dummy_conn().await;
        table.deliver(id, conn);
    }
}
