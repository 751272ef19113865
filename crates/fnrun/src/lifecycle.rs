//! # Instance Lifecycle
//!
//! [`InstanceManager`] owns every live instance of a runtime: it constructs
//! receivers through the registry, dispatches member calls against them, runs
//! the shutdown and recover hooks, snapshots and restores their state, and
//! tears them down.
//!
//! ## Identity
//!
//! Each created instance gets a fresh random id that is never reused, even
//! after termination. Handles are collected per [`HandlerKind`] so a runtime
//! can enumerate and invalidate them at finalize.
//!
//! ## Ordering
//!
//! For instances with `need_order`, a ticket is drawn on the calling thread at
//! issue time and execution waits for its turn, so calls are observed in issue
//! order even when submitted to background workers. Without `need_order` calls
//! are admitted as they arrive.
//!
//! ## Hooks
//!
//! The shutdown hook (`(I)V` taking the grace period in seconds, or `()V`) and
//! the recover hook (`()V`) are optional. A missing hook is success; a hook
//! that raises is an internal error, never a user error.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel;
use dashmap::DashMap;
use dashmap::DashSet;
use dashmap::mapref::entry::Entry;
use serde_json::Value;

use crate::class::Executable;
use crate::class::MethodFn;
use crate::config::Config;
use crate::context::InstanceCtx;
use crate::context::InstanceState;
use crate::descriptor::CONSTRUCTOR_NAME;
use crate::descriptor::FunctionDescriptor;
use crate::descriptor::Language;
use crate::engine::Engine;
use crate::engine::ObjectRef;
use crate::error::Error;
use crate::error::ErrorCode;
use crate::error::ModuleCode;
use crate::error::Result;
use crate::exception::ExceptionTranslator;
use crate::exception::Failure;
use crate::exception::Thrown;
use crate::exception::catch_panic;
use crate::instance::HandleInfo;
use crate::instance::HandlerKind;
use crate::instance::HandlerTable;
use crate::instance::InstanceHandle;
use crate::instance::LiveInstance;
use crate::options::InvokeOptions;
use crate::registry::FunctionEntry;
use crate::registry::FunctionRegistry;

pub const SHUTDOWN_SIGNATURE: &str = "(I)V";
pub const HOOK_SIGNATURE: &str = "()V";

/// Result of a submitted call.
pub struct PendingCall {
    instance_id: String,
    rx: channel::Receiver<Result<Value>>,
}

impl PendingCall {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Blocks until the call completes.
    pub fn wait(self) -> Result<Value> {
        self.rx.recv().unwrap_or_else(|_| Err(worker_lost()))
    }

    /// `None` if the call has not completed within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Value>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(channel::RecvTimeoutError::Timeout) => None,
            Err(channel::RecvTimeoutError::Disconnected) => Some(Err(worker_lost())),
        }
    }
}

fn worker_lost() -> Error {
    Error::internal(ModuleCode::RuntimeInvoke, "invocation worker exited without a result")
}

/// A member call resolved against a live instance.
struct Call {
    instance_id: String,
    live: Arc<LiveInstance>,
    entry: Arc<FunctionEntry>,
    method: MethodFn,
}

pub struct InstanceManager {
    config: Arc<Config>,
    registry: Arc<FunctionRegistry>,
    engine: Arc<dyn Engine>,
    translator: ExceptionTranslator,
    live: DashMap<String, Arc<LiveInstance>>,
    /// Every id terminated in this session. Kept for the life of the runtime
    /// so stale copies of a handle never reach the engine again and `load`
    /// cannot revive a terminated id; one entry per terminated instance.
    retired: DashSet<String>,
    real_ids: DashMap<String, String>,
    routes: DashMap<String, String>,
    handlers: HandlerTable,
}

impl InstanceManager {
    pub fn new(config: Arc<Config>, registry: Arc<FunctionRegistry>, engine: Arc<dyn Engine>) -> Self {
        let translator = ExceptionTranslator::from_config(&config);
        Self {
            config,
            registry,
            engine,
            translator,
            live: DashMap::new(),
            retired: DashSet::new(),
            real_ids: DashMap::new(),
            routes: DashMap::new(),
            handlers: HandlerTable::default(),
        }
    }

    pub fn translator(&self) -> &ExceptionTranslator {
        &self.translator
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Whether `instance_id` was terminated in this runtime.
    pub(crate) fn is_retired(&self, instance_id: &str) -> bool {
        self.retired.contains(instance_id)
    }

    pub fn state(&self, instance_id: &str) -> Option<InstanceState> {
        self.live.get(instance_id).map(|live| live.ctx.state())
    }

    fn live_instance(&self, instance_id: &str) -> Result<Arc<LiveInstance>> {
        self.live
            .get(instance_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::instance_not_found(instance_id))
    }

    /// Inserts under a fresh id that was never live before.
    fn register(&self, live: Arc<LiveInstance>) -> String {
        loop {
            let instance_id = format!("{:032x}", rand::random::<u128>());
            if self.retired.contains(&instance_id) {
                continue;
            }
            if let Entry::Vacant(slot) = self.live.entry(instance_id.clone()) {
                slot.insert(live.clone());
                return instance_id;
            }
        }
    }

    /// Constructs an instance.
    ///
    /// Foreign-language descriptors are created through the engine; host
    /// descriptors resolve a constructor and run it in this process.
    pub fn create(
        &self,
        descriptor: &FunctionDescriptor,
        args: &[Value],
        options: &InvokeOptions,
    ) -> Result<InstanceHandle> {
        options.validate()?;
        let need_order = options.resolve_need_order()?;
        if descriptor.language() == Language::Foreign {
            return self.create_remote(descriptor, args, options, need_order);
        }

        let class_name = descriptor.class_name();
        let function = match descriptor.function_name() {
            "" => CONSTRUCTOR_NAME,
            name => name,
        };
        let entry = self.registry.resolve_in(class_name, function, descriptor.signature())?;
        let Executable::Constructor(constructor) = entry.executable() else {
            return Err(Error::param_invalid(
                ModuleCode::RuntimeCreate,
                format!("{}.{}{} is not a constructor", class_name, entry.name(), entry.signature()),
            ));
        };

        let ctx = InstanceCtx::new();
        let constructed = if args.len() != entry.param_count() {
            let cause = arity_error(ModuleCode::RuntimeCreate, class_name, &entry, args.len());
            Err(Failure::Dispatch(cause))
        } else {
            catch_panic(|| constructor(args))
        };
        let object = constructed.map_err(|failure| {
            self.translator
                .translate_in(ModuleCode::RuntimeCreate, &failure, class_name, CONSTRUCTOR_NAME)
        })?;
        ctx.mark_created();

        let live = Arc::new(LiveInstance::new(class_name.to_string(), need_order, object, ctx));
        let instance_id = self.register(live.clone());
        live.ctx.activate();

        let handle = InstanceHandle::new(HandleInfo {
            function_id: descriptor.function_id().to_string(),
            need_order,
            api_type: descriptor.api_type(),
            ..HandleInfo::new(instance_id.clone(), class_name, HandlerKind::Host)
        });
        self.collect_instance_handler_info(&handle);
        tracing::info!(instance = %instance_id, class = class_name, need_order, "created instance");
        Ok(handle)
    }

    fn create_remote(
        &self,
        descriptor: &FunctionDescriptor,
        args: &[Value],
        options: &InvokeOptions,
        need_order: bool,
    ) -> Result<InstanceHandle> {
        let instance_id = self.engine.create_instance(descriptor, args, options)?;
        let handle = InstanceHandle::new(HandleInfo {
            function_id: descriptor.function_id().to_string(),
            need_order,
            api_type: descriptor.api_type(),
            ..HandleInfo::new(instance_id.clone(), descriptor.class_name(), HandlerKind::Foreign)
        });
        self.collect_instance_handler_info(&handle);
        tracing::info!(instance = %instance_id, class = descriptor.class_name(), "created remote instance");
        Ok(handle)
    }

    fn prepare(&self, handle: &InstanceHandle, descriptor: &FunctionDescriptor) -> Result<Call> {
        let info = handle.info();
        if info.kind == HandlerKind::Foreign && !info.instance_id.is_empty() {
            return Err(Error::new(
                ErrorCode::IncorrectInvokeUsage,
                ModuleCode::RuntimeInvoke,
                format!("instance {} is hosted by the engine; invoke it remotely", info.instance_id),
            ));
        }
        let live = self.live_instance(&info.instance_id)?;
        let entry = self.registry.resolve_in(
            &live.class_name,
            descriptor.function_name(),
            descriptor.signature(),
        )?;
        let Executable::Method(method) = entry.executable() else {
            return Err(Error::new(
                ErrorCode::IncorrectInvokeUsage,
                ModuleCode::RuntimeInvoke,
                format!("constructor of {} cannot be invoked on a live instance", live.class_name),
            ));
        };
        let method = method.clone();
        Ok(Call {
            instance_id: info.instance_id,
            live,
            entry,
            method,
        })
    }

    fn ticket(&self, call: &Call) -> Option<u64> {
        call.live.need_order.then(|| call.live.ctx.next_ticket())
    }

    fn run(&self, call: &Call, args: &[Value], ticket: Option<u64>) -> Result<Value> {
        let _turn = ticket.map(|ticket| call.live.ctx.wait_turn(ticket));
        let _active = call
            .live
            .ctx
            .enter()
            .map_err(|state| rejected(&call.instance_id, state))?;

        let class_name = call.live.class_name.as_str();
        let function = call.entry.name();
        tracing::debug!(
            instance = %call.instance_id,
            class = class_name,
            function,
            signature = call.entry.signature(),
            "invoke"
        );
        let result = if args.len() != call.entry.param_count() {
            let cause = arity_error(ModuleCode::RuntimeInvoke, class_name, &call.entry, args.len());
            Err(Failure::Dispatch(cause))
        } else {
            call.live.exec(|object| catch_panic(|| (call.method)(object, args)))
        };
        result.map_err(|failure| self.translator.translate(&failure, class_name, function))
    }

    /// Invokes a member of a live instance and returns its raw result.
    pub fn invoke(
        &self,
        handle: &InstanceHandle,
        descriptor: &FunctionDescriptor,
        args: &[Value],
        options: &InvokeOptions,
    ) -> Result<Value> {
        let call = self.prepare(handle, descriptor)?;
        if !options.trace_id.is_empty() {
            tracing::debug!(trace_id = %options.trace_id, instance = %call.instance_id, "traced invoke");
        }
        let ticket = self.ticket(&call);
        self.run(&call, args, ticket)
    }

    /// Issues a call that runs on a background worker.
    ///
    /// Resolution failures are reported immediately. For ordered instances
    /// the issue position is fixed before this returns.
    pub fn submit(
        self: &Arc<Self>,
        handle: &InstanceHandle,
        descriptor: &FunctionDescriptor,
        args: Vec<Value>,
        options: &InvokeOptions,
    ) -> Result<PendingCall> {
        let call = self.prepare(handle, descriptor)?;
        let ticket = self.ticket(&call);
        let (tx, rx) = channel::bounded(1);
        let instance_id = call.instance_id.clone();
        let trace_id = options.trace_id.clone();
        let manager = Arc::clone(self);
        std::thread::spawn(move || {
            let result = manager.run(&call, &args, ticket);
            if tx.send(result).is_err() {
                tracing::debug!(instance = %call.instance_id, trace_id = %trace_id, "submitted call result dropped");
            }
        });
        Ok(PendingCall { instance_id, rx })
    }

    /// Invokes a member of an engine-hosted instance.
    pub fn invoke_remote(
        &self,
        handle: &InstanceHandle,
        descriptor: &FunctionDescriptor,
        args: &[Value],
        options: &InvokeOptions,
    ) -> Result<ObjectRef> {
        let instance_id = handle.instance_id();
        if instance_id.is_empty() || self.retired.contains(&instance_id) {
            return Err(Error::instance_not_found(&instance_id));
        }
        self.engine.invoke_instance(descriptor, &instance_id, args, options)
    }

    fn hook(&self, class_name: &str, name: &str, signatures: &[&str]) -> Option<Arc<FunctionEntry>> {
        signatures.iter().find_map(|signature| {
            self.registry
                .resolve_in(class_name, name, signature)
                .ok()
                .filter(|entry| !entry.executable().is_constructor())
        })
    }

    /// Runs the shutdown hook with the given grace period, if the class has one.
    pub fn shutdown(&self, handle: &InstanceHandle, grace: Duration) -> Result<()> {
        let live = self.live_instance(&handle.instance_id())?;
        run_shutdown_hook(&live, self.shutdown_hook(&live), &self.config.shutdown_hook, grace)
    }

    fn shutdown_hook(&self, live: &LiveInstance) -> Option<Arc<FunctionEntry>> {
        self.hook(
            &live.class_name,
            &self.config.shutdown_hook,
            &[SHUTDOWN_SIGNATURE, HOOK_SIGNATURE],
        )
    }

    /// Runs the recover hook, holding new calls until it completes.
    pub fn recover(&self, handle: &InstanceHandle) -> Result<()> {
        let instance_id = handle.instance_id();
        let live = self.live_instance(&instance_id)?;
        if !live.ctx.begin_recover() {
            return Err(Error::new(
                ErrorCode::IncorrectInvokeUsage,
                ModuleCode::Runtime,
                format!("instance {} is not active", instance_id),
            ));
        }
        let hook_name = &self.config.recover_hook;
        let result = match self.hook(&live.class_name, hook_name, &[HOOK_SIGNATURE]) {
            Some(entry) => run_hook(&live, &entry, hook_name, &[]),
            None => Ok(()),
        };
        live.ctx.end_recover();
        tracing::info!(instance = %instance_id, ok = result.is_ok(), "recovered instance");
        result
    }

    /// Snapshots a live instance as `(state, class name)` bytes.
    pub fn dump(&self, instance_id: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let live = self.live_instance(instance_id)?;
        let class = self.registry.class(&live.class_name)?;
        let codec = class.state_codec().ok_or_else(|| {
            Error::param_invalid(
                ModuleCode::Runtime,
                format!("class {} does not declare serializable state", live.class_name),
            )
        })?;
        let state = live
            .exec(|object| codec.dump(object))
            .map_err(|e| Error::internal(ModuleCode::Runtime, format!("failed to dump {}: {}", instance_id, e)))?;
        let state = serde_json::to_vec(&state)
            .map_err(|e| Error::internal(ModuleCode::Runtime, e.to_string()))?;
        let class_name = serde_json::to_vec(&live.class_name)
            .map_err(|e| Error::internal(ModuleCode::Runtime, e.to_string()))?;
        Ok((state, class_name))
    }

    /// Restores a snapshot under `instance_id`.
    ///
    /// Replaces the receiver if the instance is live here, otherwise registers
    /// it as a new live instance.
    pub fn load(&self, instance_id: &str, state: &[u8], class_name: &[u8]) -> Result<InstanceHandle> {
        if instance_id.is_empty() {
            return Err(Error::param_invalid(ModuleCode::Runtime, "cannot load into an empty instance id"));
        }
        if self.retired.contains(instance_id) {
            return Err(Error::instance_not_found(instance_id));
        }
        let class_name: String = serde_json::from_slice(class_name)
            .map_err(|e| Error::param_invalid(ModuleCode::Runtime, format!("bad class name: {}", e)))?;
        let class = self.registry.class(&class_name)?;
        let codec = class.state_codec().ok_or_else(|| {
            Error::param_invalid(
                ModuleCode::Runtime,
                format!("class {} does not declare serializable state", class_name),
            )
        })?;
        let state: Value = serde_json::from_slice(state)
            .map_err(|e| Error::param_invalid(ModuleCode::Runtime, format!("bad state: {}", e)))?;
        let object = codec
            .load(state)
            .map_err(|e| Error::internal(ModuleCode::Runtime, format!("failed to load {}: {}", instance_id, e)))?;

        if let Ok(live) = self.live_instance(instance_id) {
            if live.class_name != class_name {
                return Err(Error::param_invalid(
                    ModuleCode::Runtime,
                    format!("instance {} is a {}, not a {}", instance_id, live.class_name, class_name),
                ));
            }
            live.replace(object);
            let handle = match self.handlers.get(instance_id) {
                Some(handle) => handle,
                None => {
                    let handle = InstanceHandle::new(HandleInfo {
                        need_order: live.need_order,
                        ..HandleInfo::new(instance_id, class_name.as_str(), HandlerKind::Host)
                    });
                    self.collect_instance_handler_info(&handle);
                    handle
                }
            };
            tracing::info!(instance = instance_id, class = %class_name, "restored instance in place");
            return Ok(handle);
        }

        let ctx = InstanceCtx::new();
        ctx.mark_created();
        let live = Arc::new(LiveInstance::new(class_name.clone(), true, object, ctx));
        match self.live.entry(instance_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(live.clone());
            }
            Entry::Occupied(_) => {
                return Err(Error::param_invalid(
                    ModuleCode::Runtime,
                    format!("instance {} was registered concurrently", instance_id),
                ));
            }
        }
        live.ctx.activate();
        let handle = InstanceHandle::new(HandleInfo::new(instance_id, class_name.as_str(), HandlerKind::Host));
        self.collect_instance_handler_info(&handle);
        tracing::info!(instance = instance_id, class = %class_name, "loaded instance");
        Ok(handle)
    }

    /// Terminates the instance behind `handle`.
    ///
    /// Idempotent: a cleared handle or an already-terminated instance is a
    /// no-op. With `sync` the call returns once teardown is complete.
    pub fn terminate(&self, handle: &InstanceHandle, sync: bool) -> Result<()> {
        let instance_id = handle.instance_id();
        if instance_id.is_empty() || self.retired.contains(&instance_id) {
            tracing::debug!(instance = %instance_id, "terminate: already terminated");
            return Ok(());
        }

        if let Ok(live) = self.live_instance(&instance_id) {
            if !live.ctx.begin_terminate() {
                return Ok(());
            }
            self.retired.insert(instance_id.clone());
            self.live.remove(&instance_id);
            self.forget(&instance_id, handle);

            let hook = self.shutdown_hook(&live);
            let hook_name = self.config.shutdown_hook.clone();
            let grace = Duration::from_secs(u64::from(self.config.shutdown_grace_period_secs));
            let teardown = move || {
                live.ctx.drain();
                if let Err(e) = run_shutdown_hook(&live, hook, &hook_name, grace) {
                    tracing::warn!(error = %e, "shutdown hook failed during terminate");
                }
                live.ctx.finish_terminate();
            };
            if sync {
                teardown();
            } else {
                std::thread::spawn(teardown);
            }
            tracing::info!(instance = %instance_id, sync, "terminated instance");
            return Ok(());
        }

        self.retired.insert(instance_id.clone());
        let result = if sync {
            self.engine.terminate_instance_sync(&instance_id)
        } else {
            self.engine.terminate_instance(&instance_id)
        };
        if let Err(e) = result {
            self.retired.remove(&instance_id);
            return Err(e);
        }
        self.forget(&instance_id, handle);
        tracing::info!(instance = %instance_id, sync, "terminated remote instance");
        Ok(())
    }

    fn forget(&self, instance_id: &str, handle: &InstanceHandle) {
        self.handlers.remove(instance_id);
        self.real_ids.remove(instance_id);
        self.routes.remove(instance_id);
        handle.clear();
    }

    /// Physical id of an instance; `None` when unknown.
    pub fn real_instance_id(&self, instance_id: &str) -> Option<String> {
        if let Some(real) = self.real_ids.get(instance_id) {
            return Some(real.value().clone());
        }
        if let Some(real) = self.engine.get_real_instance_id(instance_id) {
            if !real.is_empty() {
                self.real_ids.insert(instance_id.to_string(), real.clone());
            }
            return Some(real);
        }
        self.live.contains_key(instance_id).then(|| instance_id.to_string())
    }

    /// Real id cached on the handle, resolving and caching it on first use.
    pub fn resolve_real_instance_id(&self, handle: &InstanceHandle) -> Option<String> {
        let cached = handle.real_instance_id();
        if !cached.is_empty() {
            return Some(cached);
        }
        let real = self.real_instance_id(&handle.instance_id())?;
        if !real.is_empty() {
            handle.set_real_instance_id(real.as_str());
        }
        Some(real)
    }

    pub fn save_real_instance_id(&self, instance_id: &str, real_instance_id: &str, options: &InvokeOptions) {
        if !real_instance_id.is_empty() {
            self.real_ids.insert(instance_id.to_string(), real_instance_id.to_string());
        }
        self.engine.save_real_instance_id(instance_id, real_instance_id, options);
    }

    /// Routing token of an instance; `None` when unknown.
    pub fn instance_route(&self, instance_id: &str) -> Option<String> {
        if let Some(route) = self.routes.get(instance_id) {
            return Some(route.value().clone());
        }
        let route = self.engine.get_instance_route(instance_id)?;
        if !route.is_empty() {
            self.routes.insert(instance_id.to_string(), route.clone());
        }
        Some(route)
    }

    pub fn save_instance_route(&self, instance_id: &str, route: &str) {
        self.routes.insert(instance_id.to_string(), route.to_string());
        self.engine.save_instance_route(instance_id, route);
    }

    /// Records a handle in the registry of its handler kind.
    pub fn collect_instance_handler_info(&self, handle: &InstanceHandle) {
        self.handlers.collect(handle);
    }

    pub fn instance_handler_info(&self, instance_id: &str) -> Option<InstanceHandle> {
        self.handlers.get(instance_id)
    }

    pub fn handler_count(&self, kind: HandlerKind) -> usize {
        self.handlers.len(kind)
    }

    /// Zeroes every collected handle; returns how many were cleared.
    pub fn clear_handler_info(&self) -> usize {
        let cleared = self.handlers.clear();
        tracing::debug!(cleared, "cleared handler info");
        cleared
    }
}

fn arity_error(module: ModuleCode, class_name: &str, entry: &FunctionEntry, got: usize) -> Error {
    Error::param_invalid(
        module,
        format!(
            "{}.{}{} expects {} arguments, got {}",
            class_name,
            entry.name(),
            entry.signature(),
            entry.param_count(),
            got
        ),
    )
}

fn rejected(instance_id: &str, state: InstanceState) -> Error {
    match state {
        InstanceState::Terminating | InstanceState::Terminated => Error::instance_not_found(instance_id),
        other => Error::new(
            ErrorCode::IncorrectInvokeUsage,
            ModuleCode::RuntimeInvoke,
            format!("instance {} is {:?}", instance_id, other),
        ),
    }
}

fn run_shutdown_hook(
    live: &LiveInstance,
    hook: Option<Arc<FunctionEntry>>,
    hook_name: &str,
    grace: Duration,
) -> Result<()> {
    let Some(entry) = hook else {
        tracing::debug!(class = %live.class_name, hook = hook_name, "no shutdown hook");
        return Ok(());
    };
    let args = match entry.param_count() {
        0 => Vec::new(),
        _ => vec![Value::from(grace.as_secs())],
    };
    run_hook(live, &entry, hook_name, &args)
}

fn run_hook(live: &LiveInstance, entry: &FunctionEntry, hook_name: &str, args: &[Value]) -> Result<()> {
    let Executable::Method(method) = entry.executable() else {
        return Ok(());
    };
    let outcome = live.exec(|object| catch_panic(|| method(object, args)));
    match outcome {
        Ok(_) => {
            tracing::debug!(class = %live.class_name, hook = hook_name, "hook completed");
            Ok(())
        }
        Err(failure) => {
            let detail = match &failure {
                Failure::Dispatch(error) => error.message().to_string(),
                Failure::Target(Thrown::Exception(exception)) => exception.to_string(),
                Failure::Target(Thrown::Platform { error, .. }) => error.message().to_string(),
            };
            tracing::warn!(class = %live.class_name, hook = hook_name, %detail, "hook failed");
            Err(Error::internal(
                ModuleCode::Runtime,
                format!("Failed to invoke user {} function: {}", hook_name, detail),
            ))
        }
    }
}
