//! Handlers: the worker-side objects whose members can be invoked remotely.
//!
//! A handler owns a loaded [`Library`] and publishes a [`MemberTable`]. Only
//! members registered in the table are reachable from the controller; every
//! other name fails with `AttributeError`.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{Fault, short_type_name};
use crate::value::{Call, Value};

/// A callable member: receives the handler and the call arguments.
pub type MethodFn<H> = dyn Fn(&mut H, Call) -> Result<Value, Fault> + Send + Sync;

/// A value member: plain attribute or computed property.
pub type GetterFn<H> = dyn Fn(&H) -> Result<Value, Fault> + Send + Sync;

pub enum Member<H> {
    Callable(Box<MethodFn<H>>),
    Value(Box<GetterFn<H>>),
}

/// Named members a handler exposes.
pub struct MemberTable<H> {
    members: BTreeMap<String, Member<H>>,
}

impl<H> Default for MemberTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> MemberTable<H> {
    pub fn new() -> Self {
        Self {
            members: BTreeMap::new(),
        }
    }

    pub fn method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut H, Call) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        self.members
            .insert(name.to_string(), Member::Callable(Box::new(f)));
        self
    }

    /// A constant attribute.
    pub fn attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.members.insert(
            name.to_string(),
            Member::Value(Box::new(move |_: &H| Ok(value.clone()))),
        );
        self
    }

    /// A value computed from the handler each time it is read.
    pub fn property<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&H) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        self.members
            .insert(name.to_string(), Member::Value(Box::new(f)));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn invoke(&self, handler: &mut H, name: &str, call: Call) -> Result<Value, Fault> {
        match self.members.get(name) {
            Some(Member::Callable(f)) => f(handler, call),
            Some(Member::Value(get)) => get(&*handler),
            None => Err(Fault::attribute_error(format!(
                "'{}' object has no attribute '{}'",
                short_type_name::<H>(),
                name
            ))),
        }
    }
}

/// What a worker knows when it constructs its handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    host: Option<String>,
    port: i32,
    kwargs: BTreeMap<String, String>,
    search_path: Vec<PathBuf>,
}

impl HandlerContext {
    /// `host` is `None` and `port` is `-1` for an in-process mock.
    pub fn new(host: Option<String>, port: i32) -> Self {
        Self {
            host,
            port,
            ..Default::default()
        }
    }

    pub fn with_kwargs(mut self, kwargs: BTreeMap<String, String>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_search_path(mut self, search_path: Vec<PathBuf>) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> i32 {
        self.port
    }

    pub fn is_mocked(&self) -> bool {
        self.host.is_none()
    }

    /// Constructor kwargs. Always strings: they cross the launch line.
    pub fn kwargs(&self) -> &BTreeMap<String, String> {
        &self.kwargs
    }

    pub fn kwarg(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).map(String::as_str)
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// First existing match for `name`: itself when absolute, otherwise
    /// joined onto each search-path entry in order.
    pub fn locate(&self, name: impl AsRef<Path>) -> Option<PathBuf> {
        let name = name.as_ref();
        if name.is_absolute() {
            return name.exists().then(|| name.to_path_buf());
        }
        self.search_path
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.exists())
    }
}

/// Calling convention / runtime of a hosted library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibType {
    Cdll,
    Windll,
    Oledll,
    Net,
    Clr,
    Java,
    Com,
    Activex,
}

impl LibType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cdll => "cdll",
            Self::Windll => "windll",
            Self::Oledll => "oledll",
            Self::Net => "net",
            Self::Clr => "clr",
            Self::Java => "java",
            Self::Com => "com",
            Self::Activex => "activex",
        }
    }

    /// COM and ActiveX libraries are named by ProgID, not by file.
    pub fn is_registered_name(self) -> bool {
        matches!(self, Self::Com | Self::Activex)
    }
}

impl fmt::Display for LibType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LibType {
    type Err = Fault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cdll" => Ok(Self::Cdll),
            "windll" => Ok(Self::Windll),
            "oledll" => Ok(Self::Oledll),
            "net" => Ok(Self::Net),
            "clr" => Ok(Self::Clr),
            "java" => Ok(Self::Java),
            "com" => Ok(Self::Com),
            "activex" => Ok(Self::Activex),
            other => Err(Fault::value_error(format!(
                "cannot load library type '{other}'"
            ))),
        }
    }
}

/// A library bound by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    path: PathBuf,
    kind: LibType,
}

impl Library {
    pub const NOT_FOUND: &'static str = "LibraryNotFound";

    /// Resolve `path` against the search path and bind it.
    #[track_caller]
    pub fn bind(ctx: &HandlerContext, path: impl AsRef<Path>, kind: LibType) -> Result<Self, Fault> {
        let path = path.as_ref();
        if kind.is_registered_name() {
            return Ok(Self {
                path: path.to_path_buf(),
                kind,
            });
        }
        match ctx.locate(path) {
            Some(found) => Ok(Self { path: found, kind }),
            None => Err(Fault::new(
                Self::NOT_FOUND,
                format!(
                    "cannot find '{}' for libtype='{kind}' (searched {})",
                    path.display(),
                    display_paths(ctx.search_path())
                ),
            )),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> LibType {
        self.kind
    }
}

pub(crate) fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "no directories".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Worker-side object that hosts a library.
pub trait Handler: Sized + Send + 'static {
    fn construct(ctx: &HandlerContext) -> Result<Self, Fault>;

    /// The bound library, `None` until construction binds one.
    fn library(&self) -> Option<&Library>;

    fn members() -> MemberTable<Self>;

    /// Runs once when the controller asks the worker to stop.
    fn shutdown_handler(&mut self) {}
}

/// Object-safe view of a constructed handler.
pub trait Invoke: Send {
    fn type_name(&self) -> &'static str;

    fn library(&self) -> Option<&Library>;

    fn member_names(&self) -> Vec<String>;

    /// Invoke `name`. Panics inside the member become `Panic` faults.
    fn invoke(&mut self, name: &str, call: Call) -> Result<Value, Fault>;

    fn shutdown_handler(&mut self);
}

/// A handler together with its member table.
pub struct Hosted<H: Handler> {
    handler: H,
    members: MemberTable<H>,
}

impl<H: Handler> Hosted<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            members: H::members(),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H: Handler> Invoke for Hosted<H> {
    fn type_name(&self) -> &'static str {
        short_type_name::<H>()
    }

    fn library(&self) -> Option<&Library> {
        self.handler.library()
    }

    fn member_names(&self) -> Vec<String> {
        self.members.names().map(str::to_string).collect()
    }

    fn invoke(&mut self, name: &str, call: Call) -> Result<Value, Fault> {
        let Self { handler, members } = self;
        guard(|| members.invoke(handler, name, call))
    }

    fn shutdown_handler(&mut self) {
        let handler = &mut self.handler;
        if let Err(fault) = guard(|| {
            handler.shutdown_handler();
            Ok(Value::None)
        }) {
            tracing::warn!(%fault, "shutdown_handler panicked");
        }
    }
}

/// Run `f`, turning a panic into a `Panic` fault.
pub(crate) fn guard<T>(f: impl FnOnce() -> Result<T, Fault>) -> Result<T, Fault> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(Fault::bare(Fault::PANIC, panic_message(payload.as_ref())))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

type ConstructFn = fn(&HandlerContext) -> Result<Box<dyn Invoke>, Fault>;

/// Constructs one handler type.
#[derive(Clone, Copy)]
pub struct HandlerFactory {
    type_name: &'static str,
    construct: ConstructFn,
}

impl HandlerFactory {
    pub fn of<H: Handler>() -> Self {
        Self {
            type_name: short_type_name::<H>(),
            construct: |ctx| H::construct(ctx).map(|h| Box::new(Hosted::new(h)) as Box<dyn Invoke>),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn construct(&self, ctx: &HandlerContext) -> Result<Box<dyn Invoke>, Fault> {
        guard(|| (self.construct)(ctx))
    }
}

impl fmt::Debug for HandlerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFactory")
            .field("type_name", &self.type_name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("No module named '{0}'")]
    UnknownModule(String),

    #[error("module '{0}' does not contain a type that implements Handler")]
    NoHandler(String),

    #[error("module '{module}' contains more than one Handler: {}", .types.join(", "))]
    Ambiguous {
        module: String,
        types: Vec<&'static str>,
    },
}

/// Modules a worker binary can host, each with its handler types.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    modules: BTreeMap<String, Vec<HandlerFactory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: Handler>(&mut self, module: &str) -> &mut Self {
        self.modules
            .entry(module.to_string())
            .or_default()
            .push(HandlerFactory::of::<H>());
        self
    }

    /// Make `module` known without giving it a handler.
    pub fn declare(&mut self, module: &str) -> &mut Self {
        self.modules.entry(module.to_string()).or_default();
        self
    }

    pub fn modules(&self) -> impl Iterator<Item = (&str, &[HandlerFactory])> {
        self.modules
            .iter()
            .map(|(name, factories)| (name.as_str(), factories.as_slice()))
    }

    pub fn resolve(&self, module: &str) -> Result<HandlerFactory, ResolveError> {
        let factories = self
            .modules
            .get(module)
            .ok_or_else(|| ResolveError::UnknownModule(module.to_string()))?;
        match factories.as_slice() {
            [] => Err(ResolveError::NoHandler(module.to_string())),
            [factory] => Ok(*factory),
            many => Err(ResolveError::Ambiguous {
                module: module.to_string(),
                types: many.iter().map(HandlerFactory::type_name).collect(),
            }),
        }
    }
}
