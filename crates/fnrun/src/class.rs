//! # Class Definitions
//!
//! The declared type graph the registry resolves against. Instead of runtime
//! reflection every invocable member is registered up front as a tagged
//! callable together with its structural signature:
//!
//! ```ignore
//! let counter = ClassDef::class("com.acme.Counter")
//!     .implements("com.acme.Resettable")
//!     .constructor::<Counter, _>("(I)V", |args| Ok(Counter { n: arg(args, 0)? }))
//!     .method::<Counter, _>("add", "(I)I", |c, args| {
//!         c.n += arg::<i64>(args, 0)?;
//!         ret(c.n)
//!     })
//!     .build()?;
//! ```
//!
//! Typed members downcast the receiver automatically; a receiver of the wrong
//! type is a dispatch failure, never a user failure.

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::descriptor::CONSTRUCTOR_NAME;
use crate::error::ErrorCode;
use crate::error::ModuleCode;
use crate::exception::Failure;
use crate::exception::Thrown;
use crate::signature;

/// Universal root of every class hierarchy; never contributes members.
pub const ROOT_CLASS: &str = "Object";

/// A live receiver.
pub type Object = Box<dyn Any + Send>;

pub type MethodFn = Arc<dyn Fn(&mut Object, &[Value]) -> std::result::Result<Value, Failure> + Send + Sync>;
pub type ConstructorFn = Arc<dyn Fn(&[Value]) -> std::result::Result<Object, Failure> + Send + Sync>;

/// A resolved invocable.
#[derive(Clone)]
pub enum Executable {
    Method(MethodFn),
    Constructor(ConstructorFn),
}

impl Executable {
    pub fn is_constructor(&self) -> bool {
        matches!(self, Self::Constructor(_))
    }
}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Method(_) => write!(f, "Executable::Method"),
            Self::Constructor(_) => write!(f, "Executable::Constructor"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Interface,
}

/// One declared member.
#[derive(Clone, Debug)]
pub struct Member {
    name: String,
    signature: String,
    /// `None` for abstract members.
    executable: Option<Executable>,
    is_default: bool,
}

impl Member {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn executable(&self) -> Option<&Executable> {
        self.executable.as_ref()
    }

    pub fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR_NAME
    }

    pub fn is_abstract(&self) -> bool {
        self.executable.is_none()
    }

    /// Concrete method body declared on an interface.
    pub fn is_default(&self) -> bool {
        self.is_default
    }
}

/// Converts live receivers to and from a serialized snapshot.
#[derive(Clone)]
pub struct StateCodec {
    dump: Arc<dyn Fn(&Object) -> std::result::Result<Value, String> + Send + Sync>,
    load: Arc<dyn Fn(Value) -> std::result::Result<Object, String> + Send + Sync>,
}

impl StateCodec {
    pub fn dump(&self, object: &Object) -> std::result::Result<Value, String> {
        (self.dump)(object)
    }

    pub fn load(&self, state: Value) -> std::result::Result<Object, String> {
        (self.load)(state)
    }
}

impl std::fmt::Debug for StateCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StateCodec")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    InvalidSignature { class: String, member: String, reason: String },
    DuplicateMember { class: String, member: String, signature: String },
    ConstructorOnInterface { class: String },
    DefaultOutsideInterface { class: String, member: String },
    ReservedName { class: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSignature { class, member, reason } => {
                write!(f, "Invalid signature for {}.{}: {}", class, member, reason)
            }
            Self::DuplicateMember { class, member, signature } => {
                write!(f, "Duplicate member {}.{}{}", class, member, signature)
            }
            Self::ConstructorOnInterface { class } => {
                write!(f, "Interface {} cannot declare a constructor", class)
            }
            Self::DefaultOutsideInterface { class, member } => {
                write!(f, "Default method {}.{} declared outside an interface", class, member)
            }
            Self::ReservedName { class } => write!(f, "Class name {} is reserved", class),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A class or interface.
#[derive(Clone, Debug)]
pub struct ClassDef {
    name: String,
    kind: ClassKind,
    superclass: Option<String>,
    interfaces: Vec<String>,
    members: Vec<Member>,
    state: Option<StateCodec>,
}

impl ClassDef {
    pub fn class(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder::new(name.into(), ClassKind::Class)
    }

    pub fn interface(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder::new(name.into(), ClassKind::Interface)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    pub fn is_interface(&self) -> bool {
        self.kind == ClassKind::Interface
    }

    pub fn superclass(&self) -> Option<&str> {
        self.superclass.as_deref()
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn constructors(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.is_constructor())
    }

    pub fn methods(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| !m.is_constructor())
    }

    pub fn state_codec(&self) -> Option<&StateCodec> {
        self.state.as_ref()
    }
}

fn downcast_failure<T>(class: &str) -> Failure {
    Failure::Dispatch(crate::error::Error::new(
        ErrorCode::InternalSystemError,
        ModuleCode::RuntimeInvoke,
        format!(
            "receiver of {} is not a {}",
            class,
            std::any::type_name::<T>()
        ),
    ))
}

pub struct ClassBuilder {
    name: String,
    kind: ClassKind,
    superclass: Option<String>,
    interfaces: Vec<String>,
    members: Vec<Member>,
    state: Option<StateCodec>,
}

impl ClassBuilder {
    fn new(name: String, kind: ClassKind) -> Self {
        Self {
            name,
            kind,
            superclass: None,
            interfaces: Vec::new(),
            members: Vec::new(),
            state: None,
        }
    }

    pub fn extends(mut self, superclass: impl Into<String>) -> Self {
        self.superclass = Some(superclass.into());
        self
    }

    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    fn member(mut self, name: String, signature: String, executable: Option<Executable>, is_default: bool) -> Self {
        self.members.push(Member {
            name,
            signature,
            executable,
            is_default,
        });
        self
    }

    pub fn constructor<T, F>(self, signature: impl Into<String>, f: F) -> Self
    where
        T: Any + Send,
        F: Fn(&[Value]) -> std::result::Result<T, Thrown> + Send + Sync + 'static,
    {
        let ctor: ConstructorFn = Arc::new(move |args| match f(args) {
            Ok(object) => Ok(Box::new(object) as Object),
            Err(thrown) => Err(Failure::Target(thrown)),
        });
        self.member(
            CONSTRUCTOR_NAME.to_string(),
            signature.into(),
            Some(Executable::Constructor(ctor)),
            false,
        )
    }

    /// A method whose receiver is downcast to `T`.
    pub fn method<T, F>(self, name: impl Into<String>, signature: impl Into<String>, f: F) -> Self
    where
        T: Any + Send,
        F: Fn(&mut T, &[Value]) -> std::result::Result<Value, Thrown> + Send + Sync + 'static,
    {
        let class = self.name.clone();
        let method: MethodFn = Arc::new(move |object, args| {
            let Some(receiver) = object.downcast_mut::<T>() else {
                return Err(downcast_failure::<T>(&class));
            };
            f(receiver, args).map_err(Failure::Target)
        });
        self.member(name.into(), signature.into(), Some(Executable::Method(method)), false)
    }

    /// A method that works on any receiver.
    pub fn raw_method<F>(self, name: impl Into<String>, signature: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Object, &[Value]) -> std::result::Result<Value, Thrown> + Send + Sync + 'static,
    {
        let method: MethodFn = Arc::new(move |object, args| f(object, args).map_err(Failure::Target));
        self.member(name.into(), signature.into(), Some(Executable::Method(method)), false)
    }

    /// A concrete method on an interface, inherited by direct implementors.
    pub fn default_method<F>(self, name: impl Into<String>, signature: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Object, &[Value]) -> std::result::Result<Value, Thrown> + Send + Sync + 'static,
    {
        let method: MethodFn = Arc::new(move |object, args| f(object, args).map_err(Failure::Target));
        self.member(name.into(), signature.into(), Some(Executable::Method(method)), true)
    }

    pub fn abstract_method(self, name: impl Into<String>, signature: impl Into<String>) -> Self {
        self.member(name.into(), signature.into(), None, false)
    }

    /// Enables dump / load for receivers of type `T`.
    pub fn stateful<T>(mut self) -> Self
    where
        T: Any + Send + Serialize + DeserializeOwned,
    {
        let class = self.name.clone();
        let dump = Arc::new(move |object: &Object| match object.downcast_ref::<T>() {
            Some(receiver) => serde_json::to_value(receiver).map_err(|e| e.to_string()),
            None => Err(format!("receiver of {} is not a {}", class, std::any::type_name::<T>())),
        });
        let load = Arc::new(|state: Value| {
            serde_json::from_value::<T>(state)
                .map(|receiver| Box::new(receiver) as Object)
                .map_err(|e| e.to_string())
        });
        self.state = Some(StateCodec { dump, load });
        self
    }

    pub fn build(self) -> Result<ClassDef> {
        if self.name == ROOT_CLASS {
            return Err(Error::ReservedName { class: self.name });
        }

        let mut seen = HashSet::new();
        for member in &self.members {
            signature::parse(&member.signature).map_err(|e| Error::InvalidSignature {
                class: self.name.clone(),
                member: member.name.clone(),
                reason: e.to_string(),
            })?;
            if !seen.insert((member.name.as_str(), member.signature.as_str())) {
                return Err(Error::DuplicateMember {
                    class: self.name.clone(),
                    member: member.name.clone(),
                    signature: member.signature.clone(),
                });
            }
            match self.kind {
                ClassKind::Interface if member.is_constructor() => {
                    return Err(Error::ConstructorOnInterface { class: self.name.clone() });
                }
                ClassKind::Class if member.is_default => {
                    return Err(Error::DefaultOutsideInterface {
                        class: self.name.clone(),
                        member: member.name.clone(),
                    });
                }
                _ => {}
            }
        }

        Ok(ClassDef {
            name: self.name,
            kind: self.kind,
            superclass: self.superclass,
            interfaces: self.interfaces,
            members: self.members,
            state: self.state,
        })
    }
}

/// Source of class definitions.
pub trait ClassLoader: Send + Sync + 'static {
    fn load_class(&self, name: &str) -> Option<Arc<ClassDef>>;
}

/// In-memory class loader.
#[derive(Default)]
pub struct ClassPath {
    classes: DashMap<String, Arc<ClassDef>>,
}

impl ClassPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, class: ClassDef) -> Arc<ClassDef> {
        let class = Arc::new(class);
        self.classes.insert(class.name().to_string(), class.clone());
        class
    }

    pub fn with(self, class: ClassDef) -> Self {
        self.register(class);
        self
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl ClassLoader for ClassPath {
    fn load_class(&self, name: &str) -> Option<Arc<ClassDef>> {
        self.classes.get(name).map(|entry| entry.value().clone())
    }
}

fn arg_error(message: String) -> Thrown {
    Thrown::platform(crate::error::Error::param_invalid(ModuleCode::RuntimeInvoke, message))
}

/// Decodes argument `index`.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> std::result::Result<T, Thrown> {
    let Some(value) = args.get(index) else {
        return Err(arg_error(format!("missing argument {}", index)));
    };
    serde_json::from_value(value.clone())
        .map_err(|e| arg_error(format!("argument {} has the wrong type: {}", index, e)))
}

/// Encodes a return value.
pub fn ret<T: Serialize>(value: T) -> std::result::Result<Value, Thrown> {
    serde_json::to_value(value).map_err(|e| {
        Thrown::platform(crate::error::Error::internal(
            ModuleCode::RuntimeInvoke,
            format!("return value cannot be encoded: {}", e),
        ))
    })
}
