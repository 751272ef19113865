//! In-process engine.
//!
//! Keeps remote instances, identities, routes, and groups in memory and records
//! every call so behaviour around the engine boundary can be observed.

use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::descriptor::FunctionDescriptor;
use crate::engine::Engine;
use crate::engine::ObjectRef;
use crate::error::Error;
use crate::error::ModuleCode;
use crate::error::Result;
use crate::options::GroupOptions;
use crate::options::InvokeOptions;

/// Route reported for instances this engine creates.
pub const LOCAL_ROUTE: &str = "local";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteInstance {
    pub descriptor: FunctionDescriptor,
    pub args: Vec<Value>,
    pub group_name: String,
    pub terminated: bool,
}

/// One recorded call.
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub object: ObjectRef,
    pub descriptor: FunctionDescriptor,
    pub instance_id: Option<String>,
    pub args: Vec<Value>,
    pub options: InvokeOptions,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Kill {
    pub sync: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupRecord {
    pub options: GroupOptions,
    pub terminated: bool,
}

#[derive(Default)]
pub struct LocalEngine {
    next_id: AtomicU64,
    instances: DashMap<String, RemoteInstance>,
    real_ids: DashMap<String, String>,
    routes: DashMap<String, String>,
    groups: DashMap<String, GroupRecord>,
    invocations: Mutex<Vec<Invocation>>,
    kills: Mutex<Vec<(String, Kill)>>,
    failing_classes: Mutex<HashSet<String>>,
    failing_terminates: Mutex<HashSet<String>>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later create for `class_name` fail.
    pub fn fail_creates_for(&self, class_name: impl Into<String>) {
        self.failing_classes.lock().insert(class_name.into());
    }

    /// Makes the next terminate of `instance_id` fail once.
    pub fn fail_next_terminate(&self, instance_id: impl Into<String>) {
        self.failing_terminates.lock().insert(instance_id.into());
    }

    pub fn instance(&self, instance_id: &str) -> Option<RemoteInstance> {
        self.instances.get(instance_id).map(|entry| entry.value().clone())
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    pub fn kills(&self) -> Vec<(String, Kill)> {
        self.kills.lock().clone()
    }

    pub fn group(&self, group_name: &str) -> Option<GroupRecord> {
        self.groups.get(group_name).map(|entry| entry.value().clone())
    }

    fn next(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn record(
        &self,
        descriptor: &FunctionDescriptor,
        instance_id: Option<&str>,
        args: &[Value],
        options: &InvokeOptions,
    ) -> ObjectRef {
        let object = ObjectRef(self.next("obj"));
        self.invocations.lock().push(Invocation {
            object: object.clone(),
            descriptor: descriptor.clone(),
            instance_id: instance_id.map(String::from),
            args: args.to_vec(),
            options: options.clone(),
        });
        object
    }

    fn kill(&self, instance_id: &str, sync: bool) -> Result<()> {
        if self.failing_terminates.lock().remove(instance_id) {
            return Err(Error::internal(
                ModuleCode::RuntimeKill,
                format!("terminate failed for {}", instance_id),
            ));
        }
        if let Some(mut instance) = self.instances.get_mut(instance_id) {
            instance.terminated = true;
        }
        self.kills.lock().push((instance_id.to_string(), Kill { sync }));
        tracing::debug!(instance = instance_id, sync, "engine terminate");
        Ok(())
    }
}

impl Engine for LocalEngine {
    fn create_instance(
        &self,
        descriptor: &FunctionDescriptor,
        args: &[Value],
        options: &InvokeOptions,
    ) -> Result<String> {
        if self.failing_classes.lock().contains(descriptor.class_name()) {
            return Err(Error::internal(
                ModuleCode::RuntimeCreate,
                format!("scheduling failed for {}", descriptor.class_name()),
            ));
        }
        let instance_id = self.next("remote");
        self.instances.insert(
            instance_id.clone(),
            RemoteInstance {
                descriptor: descriptor.clone(),
                args: args.to_vec(),
                group_name: options.group_name.clone(),
                terminated: false,
            },
        );
        self.real_ids.insert(instance_id.clone(), format!("{}-real", instance_id));
        self.routes.insert(instance_id.clone(), LOCAL_ROUTE.to_string());
        Ok(instance_id)
    }

    fn invoke_by_name(
        &self,
        descriptor: &FunctionDescriptor,
        args: &[Value],
        options: &InvokeOptions,
    ) -> Result<ObjectRef> {
        Ok(self.record(descriptor, None, args, options))
    }

    fn invoke_instance(
        &self,
        descriptor: &FunctionDescriptor,
        instance_id: &str,
        args: &[Value],
        options: &InvokeOptions,
    ) -> Result<ObjectRef> {
        match self.instances.get(instance_id) {
            Some(instance) if !instance.terminated => {}
            _ => return Err(Error::instance_not_found(instance_id)),
        }
        Ok(self.record(descriptor, Some(instance_id), args, options))
    }

    fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.kill(instance_id, false)
    }

    fn terminate_instance_sync(&self, instance_id: &str) -> Result<()> {
        self.kill(instance_id, true)
    }

    fn get_real_instance_id(&self, instance_id: &str) -> Option<String> {
        self.real_ids.get(instance_id).map(|entry| entry.value().clone())
    }

    fn save_real_instance_id(&self, instance_id: &str, real_instance_id: &str, _options: &InvokeOptions) {
        if !real_instance_id.is_empty() {
            self.real_ids.insert(instance_id.to_string(), real_instance_id.to_string());
        }
    }

    fn get_instance_route(&self, instance_id: &str) -> Option<String> {
        self.routes.get(instance_id).map(|entry| entry.value().clone())
    }

    fn save_instance_route(&self, instance_id: &str, route: &str) {
        self.routes.insert(instance_id.to_string(), route.to_string());
    }

    fn group_create(&self, group_name: &str, options: &GroupOptions) -> Result<()> {
        self.groups.insert(
            group_name.to_string(),
            GroupRecord {
                options: options.clone(),
                terminated: false,
            },
        );
        Ok(())
    }

    fn group_wait(&self, group_name: &str, _options: &GroupOptions) -> Result<()> {
        match self.groups.get(group_name) {
            Some(group) if !group.terminated => Ok(()),
            _ => Err(Error::param_invalid(
                ModuleCode::Runtime,
                format!("group '{}' is not running", group_name),
            )),
        }
    }

    fn group_terminate(&self, group_name: &str) -> Result<()> {
        if let Some(mut group) = self.groups.get_mut(group_name) {
            group.terminated = true;
        }
        let members: Vec<String> = self
            .instances
            .iter()
            .filter(|entry| entry.group_name == group_name && !entry.terminated)
            .map(|entry| entry.key().clone())
            .collect();
        for instance_id in members {
            self.kill(&instance_id, true)?;
        }
        Ok(())
    }
}
