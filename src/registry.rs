use std::{borrow::Borrow, fmt, sync::Arc};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    transport::TransportHandle,
};

/// Opaque token minted at login and handed back by the browser's session store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> SessionId {
        SessionId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        SessionId(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        SessionId(value.to_string())
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Live transports keyed by session id. Cloning shares the same map.
///
/// Lookups never block each other. An entry only goes away through
/// [`Registry::revoke`] or by being replaced, never because a socket closed.
#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<DashMap<SessionId, TransportHandle>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Stores `handle` for `id`, disconnecting whatever transport was there before.
    pub async fn register(&self, id: SessionId, handle: TransportHandle) {
        info!(session = %id, "registering transport");
        let previous = self.entries.insert(id.clone(), Arc::clone(&handle));

        if let Some(previous) = previous {
            if Arc::ptr_eq(&previous, &handle) {
                return;
            }
            debug!(session = %id, "replacing existing transport");
            if let Err(err) = previous.disconnect().await {
                warn!(session = %id, %err, "could not disconnect replaced transport");
            }
        }
    }

    pub fn lookup(&self, id: &str) -> Option<TransportHandle> {
        self.entries.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Looks up the transport for an id supplied by the session store.
    pub fn resolve(&self, id: Option<&str>) -> Result<TransportHandle> {
        let id = id.filter(|id| !id.is_empty()).ok_or(Error::SessionInvalid)?;
        self.lookup(id).ok_or(Error::SessionInvalid)
    }

    /// Removes and disconnects the entry for `id`. Returns whether one existed.
    pub async fn revoke(&self, id: &str) -> bool {
        let Some((id, handle)) = self.entries.remove(id) else {
            return false;
        };

        info!(session = %id, "revoking transport");
        if let Err(err) = handle.disconnect().await {
            warn!(session = %id, %err, "could not disconnect revoked transport");
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("entries", &self.entries.len()).finish()
    }
}
