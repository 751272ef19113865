//! # Engine Boundary
//!
//! The external collaborator that owns scheduling, placement, and remote
//! execution. The dispatch core calls it to create and invoke instances it does
//! not host itself, to terminate remote instances, and to resolve and persist
//! the physical identity of instances crossing a tenant boundary.
//!
//! The trait is object-safe (`Arc<dyn Engine>`) and synchronous: every call
//! blocks the calling thread until the engine answers.

use serde_json::Value;

use crate::descriptor::FunctionDescriptor;
use crate::error::Result;
use crate::options::GroupOptions;
use crate::options::InvokeOptions;

/// Reference to a result object held by the engine.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectRef(pub String);

impl ObjectRef {
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "object-{}", self.0)
    }
}

pub trait Engine: Send + Sync + 'static {
    /// Creates an instance and returns its logical id.
    fn create_instance(
        &self,
        descriptor: &FunctionDescriptor,
        args: &[Value],
        options: &InvokeOptions,
    ) -> Result<String>;

    /// Stateless call.
    fn invoke_by_name(
        &self,
        descriptor: &FunctionDescriptor,
        args: &[Value],
        options: &InvokeOptions,
    ) -> Result<ObjectRef>;

    /// Stateful call against a remote instance.
    fn invoke_instance(
        &self,
        descriptor: &FunctionDescriptor,
        instance_id: &str,
        args: &[Value],
        options: &InvokeOptions,
    ) -> Result<ObjectRef>;

    /// Requests termination; returns before the instance is gone.
    fn terminate_instance(&self, instance_id: &str) -> Result<()>;

    /// Terminates and waits for completion.
    fn terminate_instance_sync(&self, instance_id: &str) -> Result<()>;

    /// `None` when the engine does not know the instance.
    fn get_real_instance_id(&self, instance_id: &str) -> Option<String>;

    fn save_real_instance_id(&self, instance_id: &str, real_instance_id: &str, options: &InvokeOptions);

    /// `None` when no route is recorded.
    fn get_instance_route(&self, instance_id: &str) -> Option<String>;

    fn save_instance_route(&self, instance_id: &str, route: &str);

    fn group_create(&self, group_name: &str, options: &GroupOptions) -> Result<()>;

    fn group_wait(&self, group_name: &str, options: &GroupOptions) -> Result<()>;

    fn group_terminate(&self, group_name: &str) -> Result<()>;
}
