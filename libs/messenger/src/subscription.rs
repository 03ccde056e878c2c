use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug)]
struct Inner {
    scheme: Option<String>,
    host: Option<String>,
    port: Option<String>,
    address: Option<String>,
}

/// Shared handle for a source the messenger receives from
///
/// A subscription is held by the messenger's registry, by the listener
/// that created it and by every receiver link feeding it. Clones share the
/// same subscription; it lives as long as its longest holder.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Mutex<Inner>>,
}

impl Subscription {
    pub(crate) fn new(scheme: Option<&str>, host: Option<&str>, port: Option<&str>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                scheme: scheme.map(str::to_string),
                host: host.map(str::to_string),
                port: port.map(str::to_string),
                address: None,
            })),
        }
    }

    pub fn scheme(&self) -> Option<String> {
        self.inner.lock().scheme.clone()
    }

    pub fn host(&self) -> Option<String> {
        self.inner.lock().host.clone()
    }

    pub fn port(&self) -> Option<String> {
        self.inner.lock().port.clone()
    }

    /// Source address last negotiated by a peer, e.g. a dynamic name
    pub fn address(&self) -> Option<String> {
        self.inner.lock().address.clone()
    }

    pub(crate) fn set_address(&self, address: Option<&str>) {
        self.inner.lock().address = address.map(str::to_string);
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Subscription {}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Subscription")
            .field("scheme", &inner.scheme)
            .field("host", &inner.host)
            .field("port", &inner.port)
            .field("address", &inner.address)
            .finish()
    }
}
