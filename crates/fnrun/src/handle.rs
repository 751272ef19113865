//! # Handle Codec
//!
//! Moves an [`InstanceHandle`] across a tenant or persistence boundary as a
//! flat string map. The map is the only sanctioned external form of a handle:
//!
//! | key | value |
//! |---|---|
//! | `instanceKey` | logical instance id |
//! | `instanceID` | physical id; omitted when unknown |
//! | `functionId` | function the instance was created from |
//! | `className` | declaring class |
//! | `needOrder` | `true` / `false`; anything but `false` imports as true |
//! | `apiType` | `0` (function) / `1` (posix) |
//! | `instanceRoute` | routing token; omitted when unknown |

use std::collections::BTreeMap;

use crate::descriptor::ApiType;
use crate::error::Error;
use crate::error::ModuleCode;
use crate::error::Result;
use crate::instance::HandleInfo;
use crate::instance::HandlerKind;
use crate::instance::InstanceHandle;
use crate::lifecycle::InstanceManager;
use crate::options::InvokeOptions;

pub const INSTANCE_KEY: &str = "instanceKey";
pub const INSTANCE_ID: &str = "instanceID";
pub const FUNCTION_ID: &str = "functionId";
pub const CLASS_NAME: &str = "className";
pub const NEED_ORDER: &str = "needOrder";
pub const API_TYPE: &str = "apiType";
pub const INSTANCE_ROUTE: &str = "instanceRoute";

pub type ExportedHandle = BTreeMap<String, String>;

pub struct HandleCodec<'a> {
    manager: &'a InstanceManager,
}

impl<'a> HandleCodec<'a> {
    pub fn new(manager: &'a InstanceManager) -> Self {
        Self { manager }
    }

    pub fn export(&self, handle: &InstanceHandle) -> Result<ExportedHandle> {
        let info = handle.info();
        if info.instance_id.is_empty() {
            return Err(Error::param_invalid(
                ModuleCode::Runtime,
                "cannot export a cleared instance handle",
            ));
        }

        let mut map = ExportedHandle::new();
        if let Some(real_instance_id) = self.manager.resolve_real_instance_id(handle) {
            map.insert(INSTANCE_ID.to_string(), real_instance_id);
        }
        if let Some(route) = self.manager.instance_route(&info.instance_id) {
            map.insert(INSTANCE_ROUTE.to_string(), route);
        }
        map.insert(NEED_ORDER.to_string(), info.need_order.to_string());
        map.insert(FUNCTION_ID.to_string(), info.function_id);
        map.insert(CLASS_NAME.to_string(), info.class_name);
        map.insert(API_TYPE.to_string(), info.api_type.as_i32().to_string());
        map.insert(INSTANCE_KEY.to_string(), info.instance_id);
        Ok(map)
    }

    /// Rebuilds a handle and registers its identity with the manager.
    ///
    /// Missing keys default to `needOrder=true`, `apiType=0`, and empty
    /// strings. An id this runtime already terminated is not registered
    /// again.
    pub fn import(&self, exported: &ExportedHandle) -> Result<InstanceHandle> {
        let field = |key: &str| exported.get(key).cloned().unwrap_or_default();

        // Only an explicit "false" turns ordering off.
        let need_order = exported.get(NEED_ORDER).map(String::as_str) != Some("false");
        let api_type = match exported.get(API_TYPE).map(String::as_str) {
            None | Some("") => ApiType::Function,
            Some(value) => value
                .parse::<i32>()
                .ok()
                .and_then(ApiType::from_i32)
                .ok_or_else(|| {
                    Error::param_invalid(ModuleCode::Runtime, format!("bad {} value '{}'", API_TYPE, value))
                })?,
        };

        let instance_id = field(INSTANCE_KEY);
        let real_instance_id = field(INSTANCE_ID);
        let route = field(INSTANCE_ROUTE);
        let handle = InstanceHandle::new(HandleInfo {
            real_instance_id: real_instance_id.clone(),
            function_id: field(FUNCTION_ID),
            need_order,
            api_type,
            ..HandleInfo::new(instance_id.clone(), field(CLASS_NAME), HandlerKind::Host)
        });

        if !instance_id.is_empty() && !self.manager.is_retired(&instance_id) {
            let options = InvokeOptions {
                need_order,
                ..InvokeOptions::default()
            };
            self.manager.save_real_instance_id(&instance_id, &real_instance_id, &options);
            if !route.is_empty() {
                self.manager.save_instance_route(&instance_id, &route);
            }
            self.manager.collect_instance_handler_info(&handle);
        }
        tracing::debug!(instance = %instance_id, need_order, "imported instance handle");
        Ok(handle)
    }
}
