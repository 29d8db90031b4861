//! Instance registry: the authoritative record of every instance and its
//! lifecycle state.
//!
//! Each name maps to its own mutex-guarded slot, so transitions for one
//! instance serialize while unrelated instances proceed in parallel. The
//! map itself is only locked (per shard) long enough to clone a slot out.

use std::{fmt, sync::Arc};

use {
    chrono::{DateTime, Utc},
    dashmap::{DashMap, mapref::entry::Entry},
    serde::Serialize,
    tokio::sync::Mutex,
    tracing::{debug, info},
};

use switchboard_channels::{ChannelTransport, ConnectionHandle};

use crate::error::GatewayError;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Uncreated,
    Created,
    Connecting,
    Connected,
    Disconnected,
}

impl InstanceState {
    /// States in which a connection handle must be present.
    pub fn holds_handle(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// `Uncreated -> Created` only happens through [`InstanceRegistry::create`].
    pub fn can_transition_to(self, to: Self) -> bool {
        use InstanceState::*;
        matches!(
            (self, to),
            (Created, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, Connecting)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uncreated => "uncreated",
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tenant's connection to the messaging network.
///
/// Fields are private so the handle/state pairing can only change through
/// the registry.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    name: String,
    state: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    handle: Option<ConnectionHandle>,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

impl Instance {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: InstanceState::Created,
            handle: None,
            created_at: Utc::now(),
            connected_at: None,
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// `None` once the instance has been removed; holders of a stale slot then
/// observe `NotFound`.
type Slot = Arc<Mutex<Option<Instance>>>;

#[derive(Default)]
pub struct InstanceRegistry {
    slots: DashMap<String, Slot>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh `Created` instance.
    ///
    /// A name whose slot is currently locked (e.g. mid-removal) still counts
    /// as taken.
    pub fn create(&self, name: &str) -> Result<Instance, GatewayError> {
        let instance = Instance::new(name);
        match self.slots.entry(name.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(Some(instance.clone()))));
            },
            Entry::Occupied(mut entry) => {
                let reusable = entry
                    .get()
                    .try_lock()
                    .map(|slot| slot.is_none())
                    .unwrap_or(false);
                if !reusable {
                    return Err(GatewayError::AlreadyExists(name.to_string()));
                }
                entry.insert(Arc::new(Mutex::new(Some(instance.clone()))));
            },
        }
        info!(instance = name, "instance created");
        Ok(instance)
    }

    /// Snapshot of one instance, by exact name.
    pub async fn get(&self, name: &str) -> Result<Instance, GatewayError> {
        let slot = self.slot(name)?;
        let guard = slot.lock().await;
        guard
            .clone()
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    /// Snapshot of every instance, sorted by name.
    pub async fn list(&self) -> Vec<Instance> {
        let slots: Vec<Slot> = self.slots.iter().map(|e| Arc::clone(e.value())).collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(instance) = slot.lock().await.clone() {
                out.push(instance);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Number of live instances. Waits out in-flight removals rather than
    /// counting their slots.
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.iter().map(|e| Arc::clone(e.value())).collect();
        let mut live = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                live += 1;
            }
        }
        live
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Move `name` to `to`, setting the handle in the same step.
    ///
    /// Fails with `InvalidTransition` if the edge is not allowed, or if the
    /// handle's presence does not match the target state.
    pub async fn transition(
        &self,
        name: &str,
        to: InstanceState,
        handle: Option<ConnectionHandle>,
    ) -> Result<Instance, GatewayError> {
        self.apply(name, None, to, handle, None).await
    }

    /// Like [`transition`](Self::transition), but only if the current handle
    /// is still `expected`. A mismatch means another attempt superseded the
    /// caller's and is reported as `InvalidTransition`.
    pub async fn transition_if(
        &self,
        name: &str,
        expected: &ConnectionHandle,
        to: InstanceState,
        handle: Option<ConnectionHandle>,
    ) -> Result<Instance, GatewayError> {
        self.apply(name, Some(expected), to, handle, None).await
    }

    /// Move the session identified by `expected` to `Disconnected` and record
    /// why, under one lock. A superseded handle leaves `last_error` untouched.
    pub async fn fail_if(
        &self,
        name: &str,
        expected: &ConnectionHandle,
        error: &str,
    ) -> Result<Instance, GatewayError> {
        self.apply(
            name,
            Some(expected),
            InstanceState::Disconnected,
            None,
            Some(error.to_string()),
        )
        .await
    }

    /// Delete `name`, tearing its session down first if it has one.
    pub async fn remove(
        &self,
        name: &str,
        transport: &dyn ChannelTransport,
    ) -> Result<Instance, GatewayError> {
        let slot = self.slot(name)?;
        let mut guard = slot.lock().await;
        let Some(instance) = guard.as_ref() else {
            return Err(GatewayError::NotFound(name.to_string()));
        };
        if let Some(handle) = instance.handle.as_ref() {
            debug!(instance = name, handle = %handle, "tearing down session before removal");
            transport.disconnect(handle).await;
        }
        let removed = guard.take().ok_or_else(|| GatewayError::NotFound(name.to_string()))?;
        drop(guard);
        self.slots.remove_if(name, |_, current| Arc::ptr_eq(current, &slot));
        info!(instance = name, "instance removed");
        Ok(removed)
    }

    fn slot(&self, name: &str) -> Result<Slot, GatewayError> {
        self.slots
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    async fn apply(
        &self,
        name: &str,
        expected: Option<&ConnectionHandle>,
        to: InstanceState,
        handle: Option<ConnectionHandle>,
        error: Option<String>,
    ) -> Result<Instance, GatewayError> {
        let slot = self.slot(name)?;
        let mut guard = slot.lock().await;
        let instance = guard
            .as_mut()
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))?;

        let invalid = || GatewayError::InvalidTransition {
            name: name.to_string(),
            from: instance.state,
            to,
        };
        if let Some(expected) = expected
            && instance.handle.as_ref() != Some(expected)
        {
            return Err(invalid());
        }
        if !instance.state.can_transition_to(to) || handle.is_some() != to.holds_handle() {
            return Err(invalid());
        }

        let from = instance.state;
        instance.state = to;
        instance.handle = handle;
        if to == InstanceState::Connected {
            instance.connected_at = Some(Utc::now());
            instance.last_error = None;
        }
        if error.is_some() {
            instance.last_error = error;
        }
        debug!(instance = name, %from, %to, "instance transitioned");
        Ok(instance.clone())
    }
}
