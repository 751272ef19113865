//! # Function Descriptors
//!
//! A [`FunctionDescriptor`] names *what* to call: the declaring class, the
//! member name, an optional structural signature, and the routing metadata the
//! engine needs (language, api type, namespace). Descriptors are immutable
//! once built; use [`FunctionDescriptor::builder`] to assemble one.

use serde::Deserialize;
use serde::Serialize;

/// Reserved member name under which constructors are indexed.
pub const CONSTRUCTOR_NAME: &str = "<init>";

/// Language the target of a descriptor is implemented in.
///
/// `Host` targets are dispatched through the local class registry. `Foreign`
/// targets are forwarded to the engine untouched.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    #[default]
    Host,
    Foreign,
}

#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ApiType {
    #[default]
    Function,
    Posix,
}

impl ApiType {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Function => 0,
            Self::Posix => 1,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Function),
            1 => Some(Self::Posix),
            _ => None,
        }
    }
}

impl From<ApiType> for i32 {
    fn from(value: ApiType) -> Self {
        value.as_i32()
    }
}

impl TryFrom<i32> for ApiType {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::from_i32(value).ok_or_else(|| format!("unknown api type {}", value))
    }
}

/// Identifies a callable member.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    #[serde(rename = "className", default)]
    class_name: String,
    #[serde(rename = "functionName", default)]
    function_name: String,
    #[serde(rename = "functionID", default)]
    function_id: String,
    #[serde(default)]
    signature: String,
    #[serde(default)]
    language: Language,
    #[serde(rename = "apiType", default)]
    api_type: ApiType,
    #[serde(default)]
    name: String,
    #[serde(rename = "ns", default)]
    namespace: String,
}

impl FunctionDescriptor {
    pub fn builder(class_name: impl Into<String>) -> FunctionDescriptorBuilder {
        FunctionDescriptorBuilder {
            descriptor: Self {
                class_name: class_name.into(),
                ..Self::default()
            },
        }
    }

    /// Shorthand for a host-language method descriptor.
    pub fn method(
        class_name: impl Into<String>,
        function_name: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self::builder(class_name)
            .function(function_name)
            .signature(signature)
            .build()
    }

    /// Shorthand for a constructor descriptor.
    pub fn constructor(class_name: impl Into<String>, signature: impl Into<String>) -> Self {
        Self::method(class_name, CONSTRUCTOR_NAME, signature)
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    /// Empty means "any overload", legal only when the name is unambiguous.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn api_type(&self) -> ApiType {
        self.api_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_constructor(&self) -> bool {
        self.function_name == CONSTRUCTOR_NAME
    }

    /// The same target, addressed through another member name and signature.
    ///
    /// Routing metadata is kept so a method call on an instance travels with
    /// the function id the instance was created from.
    pub fn with_member(&self, function_name: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            signature: signature.into(),
            ..self.clone()
        }
    }
}

impl std::fmt::Display for FunctionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}{}", self.class_name, self.function_name, self.signature)
    }
}

pub struct FunctionDescriptorBuilder {
    descriptor: FunctionDescriptor,
}

impl FunctionDescriptorBuilder {
    pub fn function(mut self, function_name: impl Into<String>) -> Self {
        self.descriptor.function_name = function_name.into();
        self
    }

    pub fn function_id(mut self, function_id: impl Into<String>) -> Self {
        self.descriptor.function_id = function_id.into();
        self
    }

    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.descriptor.signature = signature.into();
        self
    }

    pub fn language(mut self, language: Language) -> Self {
        self.descriptor.language = language;
        self
    }

    pub fn api_type(mut self, api_type: ApiType) -> Self {
        self.descriptor.api_type = api_type;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.descriptor.name = name.into();
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.descriptor.namespace = namespace.into();
        self
    }

    pub fn build(self) -> FunctionDescriptor {
        self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let descriptor = FunctionDescriptor::builder("com.acme.Counter")
            .function("add")
            .function_id("fn-1")
            .signature("(I)I")
            .api_type(ApiType::Posix)
            .namespace("tenant-a")
            .build();

        let json = serde_json::to_value(&descriptor).expect("serialize");
        assert_eq!(json["className"], "com.acme.Counter");
        assert_eq!(json["functionName"], "add");
        assert_eq!(json["functionID"], "fn-1");
        assert_eq!(json["signature"], "(I)I");
        assert_eq!(json["language"], "Host");
        assert_eq!(json["apiType"], 1);
        assert_eq!(json["ns"], "tenant-a");

        let back: FunctionDescriptor = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, descriptor);
    }

    #[test]
    fn test_partial_wire_form_defaults() {
        let descriptor: FunctionDescriptor =
            serde_json::from_str(r#"{"className":"A","functionName":"f"}"#).expect("deserialize");
        assert_eq!(descriptor.signature(), "");
        assert_eq!(descriptor.language(), Language::Host);
        assert_eq!(descriptor.api_type(), ApiType::Function);
    }

    #[test]
    fn test_unknown_api_type_rejected() {
        let result: Result<FunctionDescriptor, _> = serde_json::from_str(r#"{"apiType":9}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_with_member_keeps_routing() {
        let ctor = FunctionDescriptor::builder("A")
            .function(CONSTRUCTOR_NAME)
            .function_id("fn-a")
            .build();
        assert!(ctor.is_constructor());

        let method = ctor.with_member("get", "()I");
        assert_eq!(method.function_id(), "fn-a");
        assert_eq!(method.function_name(), "get");
        assert!(!method.is_constructor());
    }
}
