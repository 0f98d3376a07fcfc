//! Worker-side object model.
//!
//! Anything the worker exposes implements [`Exposed`]. The trait is the
//! reflection surface the registry and the descriptor builder rely on: the
//! entity reports its own kind and own keys explicitly instead of having them
//! inferred at runtime.
//!
//! [`Object`], [`Function`] and [`Class`] cover the usual shapes. Custom types
//! can implement [`Exposed`] directly.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use indexmap::IndexMap;

use crate::bridge::protocol::PropertyKey;
use crate::descriptor::{EntityKind, MemberKind};
use crate::error::RemoteError;

/// Shared handle to an exposed entity.
pub type Entity = Arc<dyn Exposed>;

/// Outcome of a call or construction on the worker.
pub type CallResult = Result<Property, RemoteError>;

type Body = Arc<dyn Fn(Invocation) -> BoxFuture<'static, CallResult> + Send + Sync>;
type Init = Arc<dyn Fn(Invocation) -> BoxFuture<'static, Result<(), RemoteError>> + Send + Sync>;

static NULL: serde_json::Value = serde_json::Value::Null;

/// A member value: plain data, or an entity that is exposed by reference.
#[derive(Clone)]
pub enum Property {
    Value(serde_json::Value),
    Entity(Entity),
}

impl Property {
    pub fn null() -> Self {
        Self::Value(serde_json::Value::Null)
    }

    pub fn kind(&self) -> MemberKind {
        match self {
            Self::Value(value) => MemberKind::of_value(value),
            Self::Entity(entity) => entity.kind().into(),
        }
    }

    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Entity(_) => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Self::Value(_) => None,
            Self::Entity(entity) => Some(entity),
        }
    }
}

impl From<serde_json::Value> for Property {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(value)
    }
}

impl From<Entity> for Property {
    fn from(entity: Entity) -> Self {
        Self::Entity(entity)
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Entity(entity) => f
                .debug_struct("Entity")
                .field("kind", &entity.kind())
                .field("name", &entity.name())
                .finish(),
        }
    }
}

/// Arguments of a call, plus the receiver when invoked as a member.
pub struct Invocation {
    this: Option<Entity>,
    args: Vec<serde_json::Value>,
}

impl Invocation {
    pub fn new(this: Option<Entity>, args: Vec<serde_json::Value>) -> Self {
        Self { this, args }
    }

    pub fn this(&self) -> Option<&Entity> {
        self.this.as_ref()
    }

    /// The receiver, or a `TypeError` when invoked without one.
    pub fn receiver(&self) -> Result<&Entity, RemoteError> {
        self.this
            .as_ref()
            .ok_or_else(|| RemoteError::type_error("cannot read properties of undefined receiver"))
    }

    pub fn args(&self) -> &[serde_json::Value] {
        &self.args
    }

    /// Positional argument, `null` when absent.
    pub fn arg(&self, index: usize) -> &serde_json::Value {
        self.args.get(index).unwrap_or(&NULL)
    }

    pub fn into_args(self) -> Vec<serde_json::Value> {
        self.args
    }
}

/// Reflection and dispatch surface of an exposed entity.
#[async_trait::async_trait]
pub trait Exposed: Send + Sync + 'static {
    fn kind(&self) -> EntityKind;

    fn name(&self) -> &str;

    /// Own enumerable keys, in a stable order.
    fn own_keys(&self) -> Vec<PropertyKey>;

    fn get(&self, key: &PropertyKey) -> Option<Property>;

    fn set(&self, key: PropertyKey, value: Property) -> Result<(), RemoteError>;

    fn has(&self, key: &PropertyKey) -> bool {
        self.get(key).is_some()
    }

    async fn call(&self, _invocation: Invocation) -> CallResult {
        Err(RemoteError::type_error(format!(
            "{} is not a function",
            display_name(self.name())
        )))
    }

    async fn construct(&self, _args: Vec<serde_json::Value>) -> CallResult {
        Err(RemoteError::type_error(format!(
            "{} is not a constructor",
            display_name(self.name())
        )))
    }
}

fn display_name(name: &str) -> &str {
    if name.is_empty() {
        "anonymous"
    } else {
        name
    }
}

fn wrap_body<F, Fut>(body: F) -> Body
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    Arc::new(move |invocation| -> BoxFuture<'static, CallResult> {
        Box::pin(body(invocation))
    })
}

/// Own properties in insertion order.
#[derive(Default)]
struct Properties(RwLock<IndexMap<PropertyKey, Property>>);

impl Properties {
    fn keys(&self) -> Vec<PropertyKey> {
        let map = self.0.read().unwrap_or_else(PoisonError::into_inner);
        map.keys().cloned().collect()
    }

    fn get(&self, key: &PropertyKey) -> Option<Property> {
        let map = self.0.read().unwrap_or_else(PoisonError::into_inner);
        map.get(key).cloned()
    }

    fn contains(&self, key: &PropertyKey) -> bool {
        let map = self.0.read().unwrap_or_else(PoisonError::into_inner);
        map.contains_key(key)
    }

    fn insert(&self, key: PropertyKey, value: Property) {
        let mut map = self.0.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(key, value);
    }
}

/// Members shared by every instance of a [`Class`]. Not own keys of the instances.
#[derive(Clone, Default)]
struct Prototype {
    methods: IndexMap<PropertyKey, Property>,
}

/// A composite object with own properties and, for class instances, a prototype.
pub struct Object {
    name: String,
    properties: Properties,
    prototype: Option<Arc<Prototype>>,
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl Object {
    pub fn new() -> Self {
        Self::named("Object")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Properties::default(),
            prototype: None,
        }
    }

    fn instance_of(class: &str, prototype: Arc<Prototype>) -> Self {
        Self {
            name: class.to_string(),
            properties: Properties::default(),
            prototype: Some(prototype),
        }
    }

    pub fn with(self, key: impl Into<PropertyKey>, value: impl Into<Property>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Install a plain-function member. The object is passed as the receiver.
    pub fn method<F, Fut>(self, key: impl Into<PropertyKey>, body: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        let key = key.into();
        let function = Function::plain(key.to_string(), body).into_entity();
        self.with(key, function)
    }

    pub fn into_entity(self) -> Entity {
        Arc::new(self)
    }
}

#[async_trait::async_trait]
impl Exposed for Object {
    fn kind(&self) -> EntityKind {
        EntityKind::Object
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn own_keys(&self) -> Vec<PropertyKey> {
        self.properties.keys()
    }

    fn get(&self, key: &PropertyKey) -> Option<Property> {
        self.properties.get(key).or_else(|| {
            self.prototype
                .as_ref()
                .and_then(|proto| proto.methods.get(key).cloned())
        })
    }

    fn set(&self, key: PropertyKey, value: Property) -> Result<(), RemoteError> {
        self.properties.insert(key, value);
        Ok(())
    }

    fn has(&self, key: &PropertyKey) -> bool {
        self.properties.contains(key)
            || self
                .prototype
                .as_ref()
                .is_some_and(|proto| proto.methods.contains_key(key))
    }
}

/// A callable entity.
///
/// Plain functions may also be constructed: the body runs with a fresh object
/// as receiver, and that object is the result unless the body returns an entity.
pub struct Function {
    name: String,
    kind: EntityKind,
    body: Body,
    properties: Properties,
}

impl Function {
    pub fn plain<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: EntityKind::PlainFunction,
            body: wrap_body(body),
            properties: Properties::default(),
        }
    }

    pub fn arrow<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        Self {
            kind: EntityKind::ArrowFunction,
            ..Self::plain(name, body)
        }
    }

    pub fn with(self, key: impl Into<PropertyKey>, value: impl Into<Property>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn into_entity(self) -> Entity {
        Arc::new(self)
    }
}

#[async_trait::async_trait]
impl Exposed for Function {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn own_keys(&self) -> Vec<PropertyKey> {
        self.properties.keys()
    }

    fn get(&self, key: &PropertyKey) -> Option<Property> {
        self.properties.get(key)
    }

    fn set(&self, key: PropertyKey, value: Property) -> Result<(), RemoteError> {
        self.properties.insert(key, value);
        Ok(())
    }

    async fn call(&self, invocation: Invocation) -> CallResult {
        (self.body)(invocation).await
    }

    async fn construct(&self, args: Vec<serde_json::Value>) -> CallResult {
        if !self.kind.is_constructible() {
            return Err(RemoteError::type_error(format!(
                "{} is not a constructor",
                display_name(&self.name)
            )));
        }
        let instance = Object::named(self.name.clone()).into_entity();
        let returned = (self.body)(Invocation::new(Some(Arc::clone(&instance)), args)).await?;
        match returned {
            Property::Entity(entity) => Ok(Property::Entity(entity)),
            Property::Value(_) => Ok(Property::Entity(instance)),
        }
    }
}

/// A constructible entity.
///
/// `construct` creates an instance whose own keys are whatever the
/// initializer assigns through the receiver; methods live on the shared
/// prototype and are reachable but not enumerated.
pub struct Class {
    name: String,
    init: Init,
    prototype: Arc<Prototype>,
    statics: Properties,
}

impl Class {
    pub fn new<F, Fut>(name: impl Into<String>, init: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RemoteError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            init: Arc::new(
                move |invocation| -> BoxFuture<'static, Result<(), RemoteError>> {
                    Box::pin(init(invocation))
                },
            ),
            prototype: Arc::new(Prototype::default()),
            statics: Properties::default(),
        }
    }

    /// Add a prototype method. Instances pass themselves as the receiver.
    pub fn method<F, Fut>(mut self, key: impl Into<PropertyKey>, body: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        let key = key.into();
        let function = Function::plain(key.to_string(), body).into_entity();
        Arc::make_mut(&mut self.prototype)
            .methods
            .insert(key, Property::Entity(function));
        self
    }

    pub fn with_static(self, key: impl Into<PropertyKey>, value: impl Into<Property>) -> Self {
        self.statics.insert(key.into(), value.into());
        self
    }

    pub fn into_entity(self) -> Entity {
        Arc::new(self)
    }
}

#[async_trait::async_trait]
impl Exposed for Class {
    fn kind(&self) -> EntityKind {
        EntityKind::Class
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn own_keys(&self) -> Vec<PropertyKey> {
        self.statics.keys()
    }

    fn get(&self, key: &PropertyKey) -> Option<Property> {
        self.statics.get(key)
    }

    fn set(&self, key: PropertyKey, value: Property) -> Result<(), RemoteError> {
        self.statics.insert(key, value);
        Ok(())
    }

    async fn call(&self, _invocation: Invocation) -> CallResult {
        Err(RemoteError::type_error(format!(
            "Class constructor {} cannot be invoked without 'new'",
            self.name
        )))
    }

    async fn construct(&self, args: Vec<serde_json::Value>) -> CallResult {
        let instance: Entity =
            Arc::new(Object::instance_of(&self.name, Arc::clone(&self.prototype)));
        (self.init)(Invocation::new(Some(Arc::clone(&instance)), args)).await?;
        Ok(Property::Entity(instance))
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("name", &self.name)
            .field("properties", &self.properties.keys())
            .finish()
    }
}

impl From<Object> for Property {
    fn from(object: Object) -> Self {
        Self::Entity(object.into_entity())
    }
}

impl From<Function> for Property {
    fn from(function: Function) -> Self {
        Self::Entity(function.into_entity())
    }
}

impl From<Class> for Property {
    fn from(class: Class) -> Self {
        Self::Entity(class.into_entity())
    }
}

/// Snapshot of an entity's own data members as a JSON object. Entities are skipped.
pub fn own_data(entity: &dyn Exposed) -> serde_json::Map<String, serde_json::Value> {
    entity
        .own_keys()
        .into_iter()
        .filter_map(|key| {
            let name = key.as_name()?.to_string();
            match entity.get(&key)? {
                Property::Value(value) => Some((name, value)),
                Property::Entity(_) => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn point_class() -> Class {
        Class::new("Point", |inv| async move {
            let this = inv.receiver()?;
            this.set("x".into(), inv.arg(0).clone().into())?;
            this.set("y".into(), inv.arg(1).clone().into())?;
            this.set("z".into(), inv.arg(2).clone().into())?;
            Ok(())
        })
        .method("sum", |inv| async move {
            let this = inv.receiver()?;
            let total: i64 = ["x", "y", "z"]
                .iter()
                .filter_map(|k| this.get(&(*k).into()))
                .filter_map(|p| p.as_value().and_then(|v| v.as_i64()))
                .sum();
            Ok(json!(total).into())
        })
    }

    #[tokio::test]
    async fn plain_function_call_uses_body() {
        let double = Function::plain("double", |inv| async move {
            let x = inv.arg(0).as_i64().unwrap_or_default();
            Ok(json!(x * 2).into())
        });
        let out = double.call(Invocation::new(None, vec![json!(21)])).await.unwrap();
        assert_eq!(out.as_value(), Some(&json!(42)));
    }

    #[tokio::test]
    async fn arrow_function_is_not_constructible() {
        let f = Function::arrow("f", |_| async { Ok(Property::null()) });
        let err = f.construct(vec![]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeError);
        assert_eq!(err.message, "f is not a constructor");
    }

    #[tokio::test]
    async fn plain_function_constructs_with_fresh_receiver() {
        let counter = Function::plain("Counter", |inv| async move {
            inv.receiver()?.set("count".into(), inv.arg(0).clone().into())?;
            Ok(Property::null())
        });
        let instance = counter.construct(vec![json!(5)]).await.unwrap();
        let instance = instance.as_entity().unwrap();
        assert_eq!(instance.kind(), EntityKind::Object);
        assert_eq!(instance.name(), "Counter");
        assert_eq!(own_data(instance.as_ref())["count"], json!(5));
    }

    #[tokio::test]
    async fn class_construct_sets_own_members() {
        let class = point_class();
        let instance = class.construct(vec![json!(1), json!(2), json!(3)]).await.unwrap();
        let instance = instance.as_entity().unwrap();

        let expected: Vec<PropertyKey> = vec!["x".into(), "y".into(), "z".into()];
        assert_eq!(instance.own_keys(), expected);
        assert!(instance.has(&"sum".into()));

        let sum = instance.get(&"sum".into()).unwrap();
        let out = sum
            .as_entity()
            .unwrap()
            .call(Invocation::new(Some(Arc::clone(instance)), vec![]))
            .await
            .unwrap();
        assert_eq!(out.as_value(), Some(&json!(6)));
    }

    #[tokio::test]
    async fn class_cannot_be_called() {
        let err = point_class()
            .call(Invocation::new(None, vec![]))
            .await
            .unwrap_err();
        assert_eq!(
            err.message,
            "Class constructor Point cannot be invoked without 'new'"
        );
    }

    #[tokio::test]
    async fn objects_are_not_callable() {
        let object = Object::new();
        let err = object.call(Invocation::new(None, vec![])).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeError);
        assert_eq!(err.message, "Object is not a function");
    }

    #[test]
    fn missing_argument_reads_as_null() {
        let inv = Invocation::new(None, vec![json!(1)]);
        assert_eq!(inv.arg(0), &json!(1));
        assert_eq!(inv.arg(3), &json!(null));
        assert!(inv.receiver().is_err());
    }

    #[test]
    fn property_kind_follows_value() {
        assert_eq!(Property::from(json!("s")).kind(), MemberKind::String);
        assert_eq!(Property::from(Object::new()).kind(), MemberKind::Object);
        assert_eq!(Property::from(point_class()).kind(), MemberKind::Class);
    }
}
