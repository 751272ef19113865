//! # fnrun
//!
//! Client-side function and instance dispatch: resolves function descriptors
//! against a declared class graph, creates and drives stateful instances,
//! moves instance handles across tenant boundaries, and translates failures
//! into a uniform error envelope.

pub mod bind;
pub mod builder;
pub mod class;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod exception;
pub mod group;
pub mod handle;
pub mod instance;
pub mod lifecycle;
pub mod local;
pub mod options;
pub mod registry;
pub mod runtime;
pub mod signature;

pub use class::ClassDef;
pub use class::ClassPath;
pub use class::arg;
pub use class::ret;
pub use config::Config;
pub use descriptor::FunctionDescriptor;
pub use error::Error;
pub use error::ErrorCode;
pub use error::Result;
pub use exception::Exception;
pub use exception::StackFrame;
pub use exception::Thrown;
pub use instance::InstanceHandle;
pub use options::InvokeOptions;
pub use runtime::Runtime;
