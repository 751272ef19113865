//! # Instance Groups
//!
//! A group queues instance creations and then performs them together: either
//! every queued instance is created, or none remains. With `same_lifecycle`
//! the members are also terminated together.

use serde_json::Value;

use crate::descriptor::FunctionDescriptor;
use crate::error::Result;
use crate::instance::InstanceHandle;
use crate::options::GroupOptions;
use crate::options::InvokeOptions;
use crate::runtime::Runtime;

struct Pending {
    descriptor: FunctionDescriptor,
    args: Vec<Value>,
    options: InvokeOptions,
}

pub struct Group {
    runtime: Runtime,
    name: String,
    options: GroupOptions,
    pending: Vec<Pending>,
    members: Vec<InstanceHandle>,
}

impl Group {
    pub(crate) fn new(runtime: Runtime, name: String, options: GroupOptions) -> Self {
        Self {
            runtime,
            name,
            options,
            pending: Vec::new(),
            members: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[InstanceHandle] {
        &self.members
    }

    /// Queues an instance; `options` is copied and tagged with the group name.
    pub fn add(&mut self, descriptor: FunctionDescriptor, args: Vec<Value>, options: &InvokeOptions) -> &mut Self {
        let options = InvokeOptions {
            group_name: self.name.clone(),
            ..options.clone()
        };
        self.pending.push(Pending {
            descriptor,
            args,
            options,
        });
        self
    }

    /// Creates every queued instance, or none of them.
    pub fn create(&mut self) -> Result<&[InstanceHandle]> {
        self.options.validate()?;
        for pending in &self.pending {
            pending.options.validate()?;
        }
        self.runtime.engine().group_create(&self.name, &self.options)?;

        let mut created = Vec::with_capacity(self.pending.len());
        for pending in &self.pending {
            match self.runtime.create(&pending.descriptor, &pending.args, &pending.options) {
                Ok(handle) => created.push(handle),
                Err(e) => {
                    tracing::warn!(group = %self.name, error = %e, "group creation failed; rolling back");
                    for handle in &created {
                        if let Err(rollback) = self.runtime.terminate(handle, true) {
                            tracing::warn!(group = %self.name, error = %rollback, "rollback terminate failed");
                        }
                    }
                    if let Err(rollback) = self.runtime.engine().group_terminate(&self.name) {
                        tracing::warn!(group = %self.name, error = %rollback, "rollback group terminate failed");
                    }
                    return Err(e);
                }
            }
        }

        self.pending.clear();
        self.members.extend(created);
        tracing::info!(group = %self.name, members = self.members.len(), "group created");
        Ok(&self.members)
    }

    pub fn wait(&self) -> Result<()> {
        self.runtime.engine().group_wait(&self.name, &self.options)
    }

    /// Terminates the members (when they share a lifecycle) and the group.
    ///
    /// Every member is attempted. Members that fail to terminate stay in
    /// [`Group::members`] and the first failure is returned, so the call can
    /// be retried.
    pub fn terminate(&mut self) -> Result<()> {
        let mut first_error = None;
        if self.options.same_lifecycle {
            let mut remaining = Vec::new();
            for handle in std::mem::take(&mut self.members) {
                if let Err(e) = self.runtime.terminate(&handle, true) {
                    tracing::warn!(group = %self.name, instance = %handle.instance_id(), error = %e, "member terminate failed");
                    first_error.get_or_insert(e);
                    remaining.push(handle);
                }
            }
            self.members = remaining;
        }
        if let Err(e) = self.runtime.engine().group_terminate(&self.name) {
            tracing::warn!(group = %self.name, error = %e, "group terminate failed");
            first_error.get_or_insert(e);
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(group = %self.name, "group terminated");
                Ok(())
            }
        }
    }
}
