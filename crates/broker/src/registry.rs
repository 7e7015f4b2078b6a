//! Device registry: maps a device uuid to its control connection, and
//! enforces that at most one control connection owns a uuid at a time.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex as SyncMutex;
use protocol::{Request, read_request, write_request};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify};

#[derive(Debug)]
pub enum RegisterError {
    Io(protocol::Error),
}

impl From<protocol::Error> for RegisterError {
    fn from(value: protocol::Error) -> Self {
        Self::Io(value)
    }
}

/// A registered device: its uuid, a write-serialized handle to its control
/// connection, and a [`Notify`] used to cancel the in-flight reader task if
/// this record gets evicted.
///
/// `OwnedReadHalf`/`OwnedWriteHalf` (from [`TcpStream::into_split`]) share one
/// underlying `Arc<TcpStream>`; dropping only the write half does not close
/// the socket or wake a task blocked reading the other half. Forced closure
/// therefore goes through `cancel`, which both the reader loop and any
/// blocked read race against.
pub struct Device {
    pub uuid: String,
    write: Mutex<OwnedWriteHalf>,
    cancel: Notify,
}

impl Device {
    /// Serialize and send `req` on the control connection.
    pub async fn send(&self, req: &Request) -> Result<(), protocol::Error> {
        let mut w = self.write.lock().await;
        write_request(&mut *w, req).await
    }

    fn request_close(&self) {
        // notify_one, not notify_waiters: there is exactly one reader task
        // per device, and notify_one stores a permit if it runs before that
        // task starts waiting, so cancellation can never be missed
        // regardless of scheduling order. notify_waiters has no such
        // permit and would race with a reader that hasn't reached its
        // first `select!` yet.
        self.cancel.notify_one();
    }
}

struct Inner {
    devices: SyncMutex<AHashMap<String, Arc<Device>>>,
}

/// Shared handle to the device registry. Cheaply cloneable.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Inner>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                devices: SyncMutex::new(AHashMap::new()),
            }),
        }
    }

    pub fn lookup(&self, uuid: &str) -> Option<Arc<Device>> {
        self.inner.devices.lock().get(uuid).cloned()
    }

    /// Claim `uuid` for `conn`: evict and close any existing owner, install
    /// the new one, reply `Ok`, and spawn the control-reader task that keeps
    /// the device's record alive until the connection errors or is replaced.
    ///
    /// On success, ownership of `conn` has transferred to the registry; the
    /// caller must not touch it again.
    pub async fn register(&self, uuid: String, conn: TcpStream) -> Result<(), RegisterError> {
        let (read, write) = conn.into_split();

        let device = Arc::new(Device {
            uuid: uuid.clone(),
            write: Mutex::new(write),
            cancel: Notify::new(),
        });

        let evicted = {
            let mut devices = self.inner.devices.lock();
            devices.insert(uuid.clone(), device.clone())
        };

        if let Some(evicted) = evicted {
            log::info!("device {uuid} re-registered, closing previous connection");
            evicted.request_close();
        }

        if let Err(err) = device.send(&Request::Ok).await {
            self.teardown(&uuid, &device);
            return Err(err.into());
        }

        tokio::spawn(control_reader(self.clone(), device, read));

        Ok(())
    }

    /// Remove `uuid` only if its current record is still `device` (not a
    /// fresher replacement), and close its connection.
    fn teardown(&self, uuid: &str, device: &Arc<Device>) {
        let mut devices = self.inner.devices.lock();
        if let Some(current) = devices.get(uuid) {
            if Arc::ptr_eq(current, device) {
                devices.remove(uuid);
            }
        }
    }
}

async fn control_reader(registry: DeviceRegistry, device: Arc<Device>, mut read: OwnedReadHalf) {
    loop {
        let req = tokio::select! {
            biased;
            _ = device.cancel.notified() => break,
            req = read_request(&mut read) => req,
        };

        match req {
            Ok(Request::Ping) => log::trace!("ping from device {}", device.uuid),
            Ok(other) => log::debug!("unexpected request on control conn of {}: {other:?}", device.uuid),
            Err(err) => {
                log::info!("control connection for device {} closed: {err}", device.uuid);
                break;
            }
        }
    }

    registry.teardown(&device.uuid, &device);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let a = TcpStream::connect(addr).await.unwrap();
        let b = accept.await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn register_then_lookup_succeeds() {
        let registry = DeviceRegistry::new();
        let (_client, server) = connected_pair().await;

        registry.register("d1".into(), server).await.unwrap();
        assert!(registry.lookup("d1").is_some());
    }

    #[tokio::test]
    async fn reregister_evicts_the_previous_owner() {
        let registry = DeviceRegistry::new();

        let (client1, server1) = connected_pair().await;
        registry.register("d1".into(), server1).await.unwrap();
        let first = registry.lookup("d1").unwrap();

        let (_client2, server2) = connected_pair().await;
        registry.register("d1".into(), server2).await.unwrap();
        let second = registry.lookup("d1").unwrap();

        assert!(!Arc::ptr_eq(&first, &second));

        // give the evicted reader task a moment to observe cancellation.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(client1);
    }

    #[tokio::test]
    async fn lookup_of_unknown_uuid_is_none() {
        let registry = DeviceRegistry::new();
        assert!(registry.lookup("nope").is_none());
    }
}
