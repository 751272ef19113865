//! # Bound Callers
//!
//! A bound caller pairs a target with a private copy of the caller's
//! [`InvokeOptions`]. The copy is taken when the options are bound, so a
//! caller that keeps mutating its own options value after binding never
//! changes what an already-bound call does.
//!
//! - [`FunctionHandler`]: a stateless function, executed by the engine.
//! - [`InstanceFunctionHandler`]: a member of a created instance.

use serde_json::Value;

use crate::descriptor::FunctionDescriptor;
use crate::engine::ObjectRef;
use crate::error::Result;
use crate::instance::InstanceHandle;
use crate::lifecycle::PendingCall;
use crate::options::InvokeOptions;
use crate::runtime::Runtime;

pub struct FunctionHandler {
    runtime: Runtime,
    descriptor: FunctionDescriptor,
    options: InvokeOptions,
}

impl FunctionHandler {
    pub(crate) fn new(runtime: Runtime, descriptor: FunctionDescriptor) -> Self {
        Self {
            runtime,
            descriptor,
            options: InvokeOptions::default(),
        }
    }

    pub fn options(mut self, options: &InvokeOptions) -> Self {
        self.options = options.clone();
        self
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    pub fn bound_options(&self) -> &InvokeOptions {
        &self.options
    }

    pub fn invoke(&self, args: &[Value]) -> Result<ObjectRef> {
        self.options.validate()?;
        tracing::debug!(function = %self.descriptor, "invoke by name");
        self.runtime
            .engine()
            .invoke_by_name(&self.descriptor, args, &self.options)
    }
}

pub struct InstanceFunctionHandler {
    runtime: Runtime,
    handle: InstanceHandle,
    descriptor: FunctionDescriptor,
    options: InvokeOptions,
}

impl InstanceFunctionHandler {
    pub(crate) fn new(runtime: Runtime, handle: InstanceHandle, descriptor: FunctionDescriptor) -> Self {
        Self {
            runtime,
            handle,
            descriptor,
            options: InvokeOptions::default(),
        }
    }

    pub fn options(mut self, options: &InvokeOptions) -> Self {
        self.options = options.clone();
        self
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    pub fn bound_options(&self) -> &InvokeOptions {
        &self.options
    }

    pub fn invoke(&self, args: &[Value]) -> Result<Value> {
        self.runtime.invoke(&self.handle, &self.descriptor, args, &self.options)
    }

    pub fn submit(&self, args: Vec<Value>) -> Result<PendingCall> {
        self.runtime.submit(&self.handle, &self.descriptor, args, &self.options)
    }

    /// Calls the member on an engine-hosted instance.
    pub fn invoke_remote(&self, args: &[Value]) -> Result<ObjectRef> {
        self.options.validate()?;
        self.runtime
            .instances()
            .invoke_remote(&self.handle, &self.descriptor, args, &self.options)
    }
}
