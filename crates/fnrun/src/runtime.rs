//! # Runtime
//!
//! The session context that owns a function registry, an instance manager, an
//! engine, and the configuration they share. There is no process-wide state:
//! each tenant gets its own `Runtime`, and handles move between runtimes only
//! through [`Runtime::export_handle`] / [`Runtime::import_handle`].
//!
//! `Runtime` is cheap to clone; clones share the same session.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::bind::FunctionHandler;
use crate::bind::InstanceFunctionHandler;
use crate::builder::InstanceBuilder;
use crate::builder::RuntimeBuilder;
use crate::class::ClassLoader;
use crate::config::Config;
use crate::descriptor::FunctionDescriptor;
use crate::engine::Engine;
use crate::error::Result;
use crate::group::Group;
use crate::handle::ExportedHandle;
use crate::handle::HandleCodec;
use crate::instance::HandlerKind;
use crate::instance::InstanceHandle;
use crate::lifecycle::InstanceManager;
use crate::lifecycle::PendingCall;
use crate::options::GroupOptions;
use crate::options::InvokeOptions;
use crate::registry::FunctionEntry;
use crate::registry::FunctionRegistry;

struct Inner {
    config: Arc<Config>,
    registry: Arc<FunctionRegistry>,
    manager: Arc<InstanceManager>,
    engine: Arc<dyn Engine>,
}

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    /// A runtime with default configuration and the in-process engine.
    pub fn new(loader: Arc<dyn ClassLoader>) -> Self {
        RuntimeBuilder::new(loader).build()
    }

    pub fn builder(loader: Arc<dyn ClassLoader>) -> RuntimeBuilder {
        RuntimeBuilder::new(loader)
    }

    pub(crate) fn from_parts(config: Config, loader: Arc<dyn ClassLoader>, engine: Arc<dyn Engine>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(FunctionRegistry::new(loader));
        let manager = Arc::new(InstanceManager::new(
            config.clone(),
            registry.clone(),
            engine.clone(),
        ));
        tracing::info!(runtime = %config.runtime_id, tenant = %config.tenant_id, "runtime started");
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                manager,
                engine,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.config.runtime_id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.inner.registry
    }

    pub fn instances(&self) -> &InstanceManager {
        &self.inner.manager
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.inner.engine
    }

    pub fn resolve(&self, descriptor: &FunctionDescriptor) -> Result<Arc<FunctionEntry>> {
        Ok(self.inner.registry.resolve(descriptor)?)
    }

    /// Starts building an instance of the class `descriptor` names.
    pub fn instance(&self, descriptor: FunctionDescriptor) -> InstanceBuilder {
        InstanceBuilder::new(self.clone(), descriptor)
    }

    /// Binds a stateless function.
    pub fn function(&self, descriptor: FunctionDescriptor) -> FunctionHandler {
        FunctionHandler::new(self.clone(), descriptor)
    }

    /// Binds a member of an existing instance.
    pub fn method(
        &self,
        handle: &InstanceHandle,
        function: impl Into<String>,
        signature: impl Into<String>,
    ) -> InstanceFunctionHandler {
        let descriptor = FunctionDescriptor::builder(handle.class_name())
            .function(function)
            .signature(signature)
            .function_id(handle.function_id())
            .api_type(handle.api_type())
            .build();
        InstanceFunctionHandler::new(self.clone(), handle.clone(), descriptor)
    }

    pub fn create(
        &self,
        descriptor: &FunctionDescriptor,
        args: &[Value],
        options: &InvokeOptions,
    ) -> Result<InstanceHandle> {
        self.inner.manager.create(descriptor, args, options)
    }

    pub fn invoke(
        &self,
        handle: &InstanceHandle,
        descriptor: &FunctionDescriptor,
        args: &[Value],
        options: &InvokeOptions,
    ) -> Result<Value> {
        self.inner.manager.invoke(handle, descriptor, args, options)
    }

    pub fn submit(
        &self,
        handle: &InstanceHandle,
        descriptor: &FunctionDescriptor,
        args: Vec<Value>,
        options: &InvokeOptions,
    ) -> Result<PendingCall> {
        self.inner.manager.submit(handle, descriptor, args, options)
    }

    pub fn shutdown(&self, handle: &InstanceHandle, grace: Duration) -> Result<()> {
        self.inner.manager.shutdown(handle, grace)
    }

    pub fn recover(&self, handle: &InstanceHandle) -> Result<()> {
        self.inner.manager.recover(handle)
    }

    pub fn dump(&self, handle: &InstanceHandle) -> Result<(Vec<u8>, Vec<u8>)> {
        self.inner.manager.dump(&handle.instance_id())
    }

    pub fn load(&self, instance_id: &str, state: &[u8], class_name: &[u8]) -> Result<InstanceHandle> {
        self.inner.manager.load(instance_id, state, class_name)
    }

    pub fn terminate(&self, handle: &InstanceHandle, sync: bool) -> Result<()> {
        self.inner.manager.terminate(handle, sync)
    }

    pub fn export_handle(&self, handle: &InstanceHandle) -> Result<ExportedHandle> {
        HandleCodec::new(&self.inner.manager).export(handle)
    }

    pub fn import_handle(&self, exported: &ExportedHandle) -> Result<InstanceHandle> {
        HandleCodec::new(&self.inner.manager).import(exported)
    }

    pub fn group(&self, name: impl Into<String>, options: GroupOptions) -> Group {
        Group::new(self.clone(), name.into(), options)
    }

    pub fn collect_instance_handler_info(&self, handle: &InstanceHandle) {
        self.inner.manager.collect_instance_handler_info(handle);
    }

    pub fn instance_handler_info(&self, instance_id: &str) -> Option<InstanceHandle> {
        self.inner.manager.instance_handler_info(instance_id)
    }

    pub fn handler_count(&self, kind: HandlerKind) -> usize {
        self.inner.manager.handler_count(kind)
    }

    /// Ends the session: every collected handle is zeroed so it can no
    /// longer reach an instance. Remote instances are left to the engine.
    pub fn finalize(&self) {
        let cleared = self.inner.manager.clear_handler_info();
        tracing::info!(runtime = %self.id(), cleared, "runtime finalized");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.inner.config.runtime_id)
            .field("tenant", &self.inner.config.tenant_id)
            .field("live", &self.inner.manager.live_count())
            .finish()
    }
}
