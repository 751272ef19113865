//! # Instance Handle
//!
//! [`InstanceHandle`] is the caller's reference to a created instance. Clones
//! share one identity cell, so when the manager zeroes a handle on terminate or
//! finalize every clone observes it and can no longer reach the instance.
//!
//! The live receiver itself is held separately in a [`LiveInstance`], owned by
//! the lifecycle manager and keyed by instance id.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;

use crate::class::Object;
use crate::context::InstanceCtx;
use crate::descriptor::ApiType;

/// Which handler family produced a handle.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    /// Created from a host-language class in this runtime.
    Host,
    /// Created through the engine for a foreign-language function.
    Foreign,
    /// Created by native code outside the class registry.
    Native,
}

/// Snapshot of a handle's identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleInfo {
    pub instance_id: String,
    /// Physical id assigned by the engine; empty until resolved.
    pub real_instance_id: String,
    pub function_id: String,
    pub class_name: String,
    pub need_order: bool,
    pub api_type: ApiType,
    pub kind: HandlerKind,
}

impl HandleInfo {
    pub fn new(instance_id: impl Into<String>, class_name: impl Into<String>, kind: HandlerKind) -> Self {
        Self {
            instance_id: instance_id.into(),
            real_instance_id: String::new(),
            function_id: String::new(),
            class_name: class_name.into(),
            need_order: true,
            api_type: ApiType::Function,
            kind,
        }
    }
}

/// Shared reference to an instance.
#[derive(Clone)]
pub struct InstanceHandle {
    inner: Arc<RwLock<HandleInfo>>,
}

impl InstanceHandle {
    pub(crate) fn new(info: HandleInfo) -> Self {
        Self {
            inner: Arc::new(RwLock::new(info)),
        }
    }

    pub fn info(&self) -> HandleInfo {
        self.inner.read().clone()
    }

    pub fn instance_id(&self) -> String {
        self.inner.read().instance_id.clone()
    }

    pub fn real_instance_id(&self) -> String {
        self.inner.read().real_instance_id.clone()
    }

    pub fn function_id(&self) -> String {
        self.inner.read().function_id.clone()
    }

    pub fn class_name(&self) -> String {
        self.inner.read().class_name.clone()
    }

    pub fn need_order(&self) -> bool {
        self.inner.read().need_order
    }

    pub fn api_type(&self) -> ApiType {
        self.inner.read().api_type
    }

    pub fn kind(&self) -> HandlerKind {
        self.inner.read().kind
    }

    /// True once terminate or finalize has zeroed the identity.
    pub fn is_cleared(&self) -> bool {
        self.inner.read().instance_id.is_empty()
    }

    /// Whether both handles share one identity cell.
    pub fn same(&self, other: &InstanceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_real_instance_id(&self, real_instance_id: impl Into<String>) {
        self.inner.write().real_instance_id = real_instance_id.into();
    }

    pub(crate) fn clear(&self) {
        let mut info = self.inner.write();
        info.instance_id.clear();
        info.class_name.clear();
        info.real_instance_id.clear();
    }
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("InstanceHandle").field(&*self.inner.read()).finish()
    }
}

/// Handles collected per handler kind, keyed by instance id.
#[derive(Default)]
pub(crate) struct HandlerTable {
    host: DashMap<String, InstanceHandle>,
    foreign: DashMap<String, InstanceHandle>,
    native: DashMap<String, InstanceHandle>,
}

impl HandlerTable {
    fn map(&self, kind: HandlerKind) -> &DashMap<String, InstanceHandle> {
        match kind {
            HandlerKind::Host => &self.host,
            HandlerKind::Foreign => &self.foreign,
            HandlerKind::Native => &self.native,
        }
    }

    fn maps(&self) -> [&DashMap<String, InstanceHandle>; 3] {
        [&self.host, &self.foreign, &self.native]
    }

    pub(crate) fn collect(&self, handle: &InstanceHandle) {
        let info = handle.info();
        if info.instance_id.is_empty() {
            return;
        }
        self.map(info.kind).insert(info.instance_id, handle.clone());
    }

    pub(crate) fn get(&self, instance_id: &str) -> Option<InstanceHandle> {
        self.maps()
            .into_iter()
            .find_map(|map| map.get(instance_id).map(|entry| entry.value().clone()))
    }

    pub(crate) fn remove(&self, instance_id: &str) {
        for map in self.maps() {
            map.remove(instance_id);
        }
    }

    pub(crate) fn len(&self, kind: HandlerKind) -> usize {
        self.map(kind).len()
    }

    /// Zeroes every collected handle and forgets them.
    pub(crate) fn clear(&self) -> usize {
        let mut cleared = 0;
        for map in self.maps() {
            // Zero and remove under the same shard lock.
            map.retain(|_, handle| {
                handle.clear();
                cleared += 1;
                false
            });
        }
        cleared
    }
}

/// A constructed receiver and its execution context.
pub(crate) struct LiveInstance {
    pub(crate) class_name: String,
    pub(crate) need_order: bool,
    pub(crate) ctx: InstanceCtx,
    object: Mutex<Object>,
}

impl LiveInstance {
    pub(crate) fn new(class_name: String, need_order: bool, object: Object, ctx: InstanceCtx) -> Self {
        Self {
            class_name,
            need_order,
            ctx,
            object: Mutex::new(object),
        }
    }

    /// Runs `f` with exclusive access to the receiver.
    pub(crate) fn exec<R>(&self, f: impl FnOnce(&mut Object) -> R) -> R {
        let mut object = self.object.lock();
        f(&mut object)
    }

    pub(crate) fn replace(&self, object: Object) {
        *self.object.lock() = object;
    }
}
