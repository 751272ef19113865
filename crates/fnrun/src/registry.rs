//! # Function Registry
//!
//! Maps a [`FunctionDescriptor`] to the executable member it names.
//!
//! ## Population
//!
//! The first resolution against a class walks its hierarchy once and caches a
//! [`ClassRegistry`] for it:
//!
//! 1. declared methods and constructors of the class itself,
//! 2. methods of each superclass up to (excluding) the root class,
//! 3. default methods of each directly implemented interface.
//!
//! The collected list is reversed and inserted by `(name, signature)` with
//! last-write-wins, so a member declared closer to the class shadows an
//! inherited one with the same key. The resulting override order is fully
//! determined by the declared graph.
//!
//! ## Caching
//!
//! Each class has its own once-initialised cell. Concurrent first callers for
//! the same class block on that cell while one of them populates it; callers
//! for other classes proceed independently. Populated registries are never
//! rebuilt, so the same descriptor always resolves to the same
//! [`FunctionEntry`] allocation.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::class::ClassDef;
use crate::class::ClassLoader;
use crate::class::Executable;
use crate::class::ROOT_CLASS;
use crate::descriptor::FunctionDescriptor;
use crate::error::ErrorCode;
use crate::error::ModuleCode;
use crate::signature;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    ClassNotFound(String),
    NotFound {
        class: String,
        function: String,
        signature: String,
    },
    /// An empty signature matched several overloads.
    AmbiguousOverload {
        class: String,
        function: String,
        candidates: Vec<String>,
    },
    InvalidSignature {
        class: String,
        function: String,
        signature: String,
    },
    CyclicHierarchy(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClassNotFound(class) => write!(f, "Class not found: {}", class),
            Self::NotFound { class, function, signature } => {
                write!(f, "Function not found: {}.{}{}", class, function, signature)
            }
            Self::AmbiguousOverload { class, function, candidates } => write!(
                f,
                "Ambiguous overload {}.{}: candidates {}",
                class,
                function,
                candidates.join(", ")
            ),
            Self::InvalidSignature { class, function, signature } => {
                write!(f, "Invalid signature for {}.{}: {}", class, function, signature)
            }
            Self::CyclicHierarchy(class) => write!(f, "Cyclic class hierarchy at {}", class),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for crate::error::Error {
    fn from(e: Error) -> Self {
        let code = match &e {
            Error::ClassNotFound(_) => ErrorCode::ClassNotFound,
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::AmbiguousOverload { .. } => ErrorCode::AmbiguousOverload,
            Error::InvalidSignature { .. } | Error::CyclicHierarchy(_) => ErrorCode::ParamInvalid,
        };
        crate::error::Error::new(code, ModuleCode::Runtime, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A resolved member.
#[derive(Debug)]
pub struct FunctionEntry {
    name: String,
    signature: String,
    declaring_class: String,
    executable: Executable,
    param_count: usize,
    is_default_interface_method: bool,
}

impl FunctionEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The class or interface that declared the body.
    pub fn declaring_class(&self) -> &str {
        &self.declaring_class
    }

    pub fn executable(&self) -> &Executable {
        &self.executable
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn is_default_interface_method(&self) -> bool {
        self.is_default_interface_method
    }
}

/// Resolved members of one class, including inherited ones.
#[derive(Debug)]
pub struct ClassRegistry {
    class_name: String,
    entries: HashMap<(String, String), Arc<FunctionEntry>>,
    overloads: HashMap<String, Vec<String>>,
    inheritance: BTreeSet<String>,
}

impl ClassRegistry {
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Classes and interfaces that contributed at least one entry.
    pub fn inheritance_info(&self) -> &BTreeSet<String> {
        &self.inheritance
    }

    /// Signatures registered under `function`, sorted.
    pub fn overloads(&self, function: &str) -> &[String] {
        self.overloads.get(function).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<FunctionEntry>> {
        self.entries.values()
    }

    pub fn lookup(&self, function: &str, signature: &str) -> Result<Arc<FunctionEntry>> {
        if let Some(entry) = self.entries.get(&(function.to_string(), signature.to_string())) {
            return Ok(entry.clone());
        }

        let not_found = || Error::NotFound {
            class: self.class_name.clone(),
            function: function.to_string(),
            signature: signature.to_string(),
        };
        if !signature.is_empty() {
            return Err(not_found());
        }
        match self.overloads.get(function).map(Vec::as_slice) {
            Some([only]) => self
                .entries
                .get(&(function.to_string(), only.clone()))
                .cloned()
                .ok_or_else(not_found),
            Some(candidates) if !candidates.is_empty() => Err(Error::AmbiguousOverload {
                class: self.class_name.clone(),
                function: function.to_string(),
                candidates: candidates.to_vec(),
            }),
            _ => Err(not_found()),
        }
    }

    fn build(class_name: &str, members: Vec<(Arc<ClassDef>, usize)>) -> Result<Self> {
        let mut entries = HashMap::new();
        let mut inheritance = BTreeSet::new();

        for (declaring, index) in members.into_iter().rev() {
            let member = &declaring.members()[index];
            let Some(executable) = member.executable() else { continue };
            let param_count = signature::param_count(member.signature()).map_err(|_| Error::InvalidSignature {
                class: declaring.name().to_string(),
                function: member.name().to_string(),
                signature: member.signature().to_string(),
            })?;
            let entry = FunctionEntry {
                name: member.name().to_string(),
                signature: member.signature().to_string(),
                declaring_class: declaring.name().to_string(),
                executable: executable.clone(),
                param_count,
                is_default_interface_method: member.is_default(),
            };
            entries.insert(
                (member.name().to_string(), member.signature().to_string()),
                Arc::new(entry),
            );
        }

        let mut overloads: HashMap<String, Vec<String>> = HashMap::new();
        for (name, signature) in entries.keys() {
            overloads.entry(name.clone()).or_default().push(signature.clone());
        }
        for signatures in overloads.values_mut() {
            signatures.sort();
        }
        for entry in entries.values() {
            inheritance.insert(entry.declaring_class.clone());
        }

        Ok(Self {
            class_name: class_name.to_string(),
            entries,
            overloads,
            inheritance,
        })
    }
}

type RegistryCell = Arc<OnceCell<Arc<ClassRegistry>>>;

/// Resolves descriptors to executables.
pub struct FunctionRegistry {
    loader: Arc<dyn ClassLoader>,
    classes: DashMap<String, Arc<ClassDef>>,
    registries: DashMap<String, RegistryCell>,
}

impl FunctionRegistry {
    pub fn new(loader: Arc<dyn ClassLoader>) -> Self {
        Self {
            loader,
            classes: DashMap::new(),
            registries: DashMap::new(),
        }
    }

    /// Loads a class once through the loader and caches it.
    pub fn class(&self, name: &str) -> Result<Arc<ClassDef>> {
        if let Some(class) = self.classes.get(name) {
            return Ok(class.value().clone());
        }
        let class = self
            .loader
            .load_class(name)
            .ok_or_else(|| Error::ClassNotFound(name.to_string()))?;
        Ok(self.classes.entry(name.to_string()).or_insert(class).value().clone())
    }

    pub fn resolve(&self, descriptor: &FunctionDescriptor) -> Result<Arc<FunctionEntry>> {
        self.resolve_in(
            descriptor.class_name(),
            descriptor.function_name(),
            descriptor.signature(),
        )
    }

    pub fn resolve_in(&self, class_name: &str, function: &str, signature: &str) -> Result<Arc<FunctionEntry>> {
        self.class_registry(class_name)?.lookup(function, signature)
    }

    /// The populated registry of a class, building it on first use.
    pub fn class_registry(&self, class_name: &str) -> Result<Arc<ClassRegistry>> {
        if let Some(cell) = self.registries.get(class_name) {
            if let Some(registry) = cell.get() {
                return Ok(registry.clone());
            }
        }

        // Clone the cell out so the map shard is not locked while populating.
        let cell = self.registries.entry(class_name.to_string()).or_default().value().clone();
        let registry = cell.get_or_try_init(|| self.populate(class_name).map(Arc::new))?;
        Ok(registry.clone())
    }

    pub fn inheritance_info(&self, class_name: &str) -> Result<BTreeSet<String>> {
        Ok(self.class_registry(class_name)?.inheritance_info().clone())
    }

    /// Classes whose registry has been populated.
    pub fn populated(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registries
            .iter()
            .filter(|entry| entry.value().get().is_some())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    fn populate(&self, class_name: &str) -> Result<ClassRegistry> {
        let class = self.class(class_name)?;
        let mut members: Vec<(Arc<ClassDef>, usize)> = Vec::new();

        for (index, _) in class.members().iter().enumerate() {
            members.push((class.clone(), index));
        }

        let mut visited = HashSet::from([class.name().to_string()]);
        let mut next = class.superclass().map(String::from);
        while let Some(name) = next {
            if name == ROOT_CLASS {
                break;
            }
            if !visited.insert(name.clone()) {
                return Err(Error::CyclicHierarchy(name));
            }
            let superclass = self.class(&name)?;
            for (index, member) in superclass.members().iter().enumerate() {
                if !member.is_constructor() {
                    members.push((superclass.clone(), index));
                }
            }
            next = superclass.superclass().map(String::from);
        }

        for name in class.interfaces() {
            let interface = self.class(name)?;
            for (index, member) in interface.members().iter().enumerate() {
                if member.is_default() {
                    members.push((interface.clone(), index));
                }
            }
        }

        let registry = ClassRegistry::build(class.name(), members)?;
        tracing::debug!(
            class = class_name,
            entries = registry.len(),
            inherited_from = registry.inheritance.len(),
            "populated class registry"
        );
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use serde_json::Value;

    use super::*;
    use crate::class::ClassPath;
    use crate::class::Object;
    use crate::class::ret;

    struct Unit;

    fn tagged(tag: &'static str) -> impl Fn(&mut Unit, &[Value]) -> std::result::Result<Value, crate::exception::Thrown> {
        move |_, _| ret(tag)
    }

    fn call(entry: &FunctionEntry) -> Value {
        let Executable::Method(method) = entry.executable() else {
            panic!("expected method");
        };
        let mut object: Object = Box::new(Unit);
        method(&mut object, &[]).expect("invoke")
    }

    fn class_path() -> ClassPath {
        ClassPath::new()
            .with(
                ClassDef::interface("Greeter")
                    .abstract_method("name", "()Ljava/lang/String;")
                    .default_method("greet", "()Ljava/lang/String;", |_, _| ret("greeter"))
                    .default_method("wave", "()Ljava/lang/String;", |_, _| ret("greeter"))
                    .build()
                    .expect("Greeter"),
            )
            .with(
                ClassDef::class("Base")
                    .constructor::<Unit, _>("()V", |_| Ok(Unit))
                    .method::<Unit, _>("who", "()Ljava/lang/String;", tagged("base"))
                    .method::<Unit, _>("only_base", "()Ljava/lang/String;", tagged("base"))
                    .build()
                    .expect("Base"),
            )
            .with(
                ClassDef::class("Derived")
                    .extends("Base")
                    .implements("Greeter")
                    .constructor::<Unit, _>("()V", |_| Ok(Unit))
                    .method::<Unit, _>("who", "()Ljava/lang/String;", tagged("derived"))
                    .method::<Unit, _>("greet", "()Ljava/lang/String;", tagged("derived"))
                    .method::<Unit, _>("add", "(I)I", tagged("add-int"))
                    .method::<Unit, _>("add", "(J)J", tagged("add-long"))
                    .abstract_method("pending", "()V")
                    .build()
                    .expect("Derived"),
            )
    }

    #[test]
    fn test_own_methods_shadow_inherited() {
        let registry = FunctionRegistry::new(Arc::new(class_path()));
        let who = registry.resolve_in("Derived", "who", "()Ljava/lang/String;").expect("who");
        assert_eq!(who.declaring_class(), "Derived");
        assert_eq!(call(&who), Value::from("derived"));

        let greet = registry.resolve_in("Derived", "greet", "").expect("greet");
        assert_eq!(call(&greet), Value::from("derived"));
        assert!(!greet.is_default_interface_method());
    }

    #[test]
    fn test_inherited_and_default_members_resolve() {
        let registry = FunctionRegistry::new(Arc::new(class_path()));
        let only_base = registry.resolve_in("Derived", "only_base", "").expect("only_base");
        assert_eq!(only_base.declaring_class(), "Base");

        let wave = registry.resolve_in("Derived", "wave", "").expect("wave");
        assert_eq!(wave.declaring_class(), "Greeter");
        assert!(wave.is_default_interface_method());

        let info = registry.inheritance_info("Derived").expect("info");
        assert_eq!(
            info.into_iter().collect::<Vec<_>>(),
            vec!["Base".to_string(), "Derived".to_string(), "Greeter".to_string()]
        );
    }

    #[test]
    fn test_abstract_and_superclass_constructors_skipped() {
        let registry = FunctionRegistry::new(Arc::new(class_path()));
        let pending = registry.resolve_in("Derived", "pending", "()V");
        assert!(matches!(pending, Err(Error::NotFound { .. })));

        let ctor = registry.resolve_in("Derived", "<init>", "()V").expect("ctor");
        assert_eq!(ctor.declaring_class(), "Derived");
        assert!(ctor.executable().is_constructor());
    }

    #[test]
    fn test_overload_resolution() {
        let registry = FunctionRegistry::new(Arc::new(class_path()));
        let long = registry.resolve_in("Derived", "add", "(J)J").expect("long");
        assert_eq!(call(&long), Value::from("add-long"));

        match registry.resolve_in("Derived", "add", "") {
            Err(Error::AmbiguousOverload { candidates, .. }) => {
                assert_eq!(candidates, vec!["(I)I".to_string(), "(J)J".to_string()]);
            }
            other => panic!("expected ambiguity, got {:?}", other.map(|e| e.declaring_class().to_string())),
        }

        let missing = registry.resolve_in("Derived", "add", "(D)D");
        assert!(matches!(missing, Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_missing_class() {
        let registry = FunctionRegistry::new(Arc::new(class_path()));
        let result = registry.resolve(&FunctionDescriptor::method("Nope", "f", ""));
        assert_eq!(result.map(|_| ()), Err(Error::ClassNotFound("Nope".to_string())));
        let error: crate::error::Error = Error::ClassNotFound("Nope".to_string()).into();
        assert_eq!(error.code(), ErrorCode::ClassNotFound);
    }

    struct CountingLoader {
        inner: ClassPath,
        loads: AtomicUsize,
    }

    impl ClassLoader for CountingLoader {
        fn load_class(&self, name: &str) -> Option<Arc<ClassDef>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load_class(name)
        }
    }

    #[test]
    fn test_cache_returns_identical_entry() {
        let loader = Arc::new(CountingLoader {
            inner: class_path(),
            loads: AtomicUsize::new(0),
        });
        let registry = FunctionRegistry::new(loader.clone());

        let first = registry.resolve_in("Derived", "who", "").expect("first");
        let loads_after_first = loader.loads.load(Ordering::SeqCst);
        let second = registry.resolve_in("Derived", "who", "").expect("second");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.loads.load(Ordering::SeqCst), loads_after_first);
        assert_eq!(loads_after_first, 3);
        assert_eq!(registry.populated(), vec!["Derived".to_string()]);
    }

    #[test]
    fn test_concurrent_first_resolution_populates_once() {
        let loader = Arc::new(CountingLoader {
            inner: class_path(),
            loads: AtomicUsize::new(0),
        });
        let registry = FunctionRegistry::new(loader.clone());

        let entries: Vec<Arc<FunctionEntry>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| s.spawn(|| registry.resolve_in("Derived", "who", "").expect("resolve")))
                .collect();
            handles.into_iter().map(|h| h.join().expect("join")).collect()
        });

        for entry in &entries[1..] {
            assert!(Arc::ptr_eq(&entries[0], entry));
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cycle_detected() {
        let loader = ClassPath::new()
            .with(ClassDef::class("A").extends("B").build().expect("A"))
            .with(ClassDef::class("B").extends("A").build().expect("B"));
        let registry = FunctionRegistry::new(Arc::new(loader));
        assert!(matches!(
            registry.class_registry("A"),
            Err(Error::CyclicHierarchy(_))
        ));
    }
}
