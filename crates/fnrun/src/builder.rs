//! # Builders
//!
//! Fluent construction of runtimes and instances.
//!
//! ```ignore
//! let runtime = Runtime::builder(Arc::new(classes))
//!     .config(Config::default().with_tenant("tenant-a"))
//!     .build();
//!
//! let counter = runtime
//!     .instance(FunctionDescriptor::constructor("com.acme.Counter", "(J)V"))
//!     .options(&options)
//!     .arg(5)
//!     .create()?;
//! ```

use std::sync::Arc;

use serde_json::Value;

use crate::class::ClassLoader;
use crate::config::Config;
use crate::descriptor::FunctionDescriptor;
use crate::engine::Engine;
use crate::error::Result;
use crate::instance::InstanceHandle;
use crate::local::LocalEngine;
use crate::options::InvokeOptions;
use crate::runtime::Runtime;

pub struct RuntimeBuilder {
    loader: Arc<dyn ClassLoader>,
    config: Config,
    engine: Option<Arc<dyn Engine>>,
}

impl RuntimeBuilder {
    pub fn new(loader: Arc<dyn ClassLoader>) -> Self {
        Self {
            loader,
            config: Config::default(),
            engine: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Replaces the in-process engine.
    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> Runtime {
        let engine: Arc<dyn Engine> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(LocalEngine::new()),
        };
        Runtime::from_parts(self.config, self.loader, engine)
    }
}

/// Fluent creation of one instance.
pub struct InstanceBuilder {
    runtime: Runtime,
    descriptor: FunctionDescriptor,
    options: InvokeOptions,
    args: Vec<Value>,
}

impl InstanceBuilder {
    pub(crate) fn new(runtime: Runtime, descriptor: FunctionDescriptor) -> Self {
        Self {
            runtime,
            descriptor,
            options: InvokeOptions::default(),
            args: Vec::new(),
        }
    }

    /// Copies `options`; later changes to the caller's value are not seen.
    pub fn options(mut self, options: &InvokeOptions) -> Self {
        self.options = options.clone();
        self
    }

    pub fn arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn create(self) -> Result<InstanceHandle> {
        self.runtime.create(&self.descriptor, &self.args, &self.options)
    }
}
