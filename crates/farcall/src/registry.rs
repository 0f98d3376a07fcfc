//! Worker exposure registry - runs inside the worker.
//!
//! Owns the slot table of exposed entities and answers requests against it.
//! The host side (request correlation, stand-ins) is in controller.rs.
//!
//! Slot lifecycle: `unexposed → exposed → tombstoned`. Tombstoned is terminal and
//! is only entered through `destroy`. Each slot sits behind its own async
//! RwLock: every action holds the read guard until it has answered, `destroy`
//! takes the write guard, so a destroy never lands in the middle of a call on
//! the same slot.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{RwLock, Semaphore, mpsc};
use tokio::task::JoinSet;

use crate::bridge::channel::WorkerChannel;
use crate::bridge::protocol::{
    Action, InvocationId, PropertyKey, Request, Response, ResponseBody, SlotId,
};
use crate::descriptor::{Descriptor, MemberKind, describe};
use crate::entity::{Entity, Invocation, Property};
use crate::error::{RemoteError, WorkerError};

type SlotCell = Arc<RwLock<Option<Entity>>>;

pub struct WorkerConfig {
    /// Upper bound on requests being handled concurrently.
    pub max_in_flight: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { max_in_flight: 64 }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n.max(1);
        self
    }
}

/// Actions that run against a live entity under the slot's read guard.
enum Op {
    Read,
    Write,
    Has,
    Call,
    Construct,
}

/// Where a member path lands before its last segment is applied.
enum Base {
    Entity(Entity),
    Data(serde_json::Value),
    Missing,
}

impl Base {
    fn member(&self, key: &PropertyKey) -> Option<Property> {
        match self {
            Self::Entity(entity) => entity.get(key),
            Self::Data(value) => data_member(value, key).map(Property::Value),
            Self::Missing => None,
        }
    }

    fn walk(root: Entity, segments: &[PropertyKey]) -> Self {
        segments
            .iter()
            .fold(Self::Entity(root), |base, segment| match base.member(segment) {
                Some(Property::Entity(entity)) => Self::Entity(entity),
                Some(Property::Value(value)) => Self::Data(value),
                None => Self::Missing,
            })
    }
}

fn data_member(value: &serde_json::Value, key: &PropertyKey) -> Option<serde_json::Value> {
    let name = key.as_name()?;
    match value {
        serde_json::Value::Object(map) => map.get(name).cloned(),
        serde_json::Value::Array(items) => name
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i))
            .cloned(),
        _ => None,
    }
}

/// Slot table plus request dispatch.
#[derive(Default)]
pub struct Registry {
    slots: StdMutex<Vec<SlotCell>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `entity` the next slot and describe it.
    pub fn expose(&self, entity: Entity) -> Descriptor {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = SlotId::new(slots.len() as u64);
        let descriptor = describe(slot, entity.as_ref());
        slots.push(Arc::new(RwLock::new(Some(entity))));
        tracing::trace!(%slot, kind = ?descriptor.kind, name = %descriptor.name, "Exposed entity");
        descriptor
    }

    /// Expose the entities announced at bootstrap.
    ///
    /// Fails without touching the slot table if any root is plain data.
    pub fn expose_roots(&self, roots: Vec<Property>) -> Result<Vec<Descriptor>, WorkerError> {
        let entities = roots
            .into_iter()
            .map(|root| match root {
                Property::Entity(entity) => Ok(entity),
                Property::Value(value) => Err(WorkerError::Validation {
                    kind: MemberKind::of_value(&value),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entities
            .into_iter()
            .map(|entity| self.expose(entity))
            .collect())
    }

    /// Number of slots ever assigned, tombstoned ones included.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `slot` still holds an entity. A slot being destroyed right now counts as live.
    pub fn is_live(&self, slot: SlotId) -> bool {
        self.cell(slot)
            .is_some_and(|cell| cell.try_read().map(|entry| entry.is_some()).unwrap_or(true))
    }

    pub fn live_count(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .iter()
            .filter(|cell| cell.try_read().map(|entry| entry.is_some()).unwrap_or(true))
            .count()
    }

    fn cell(&self, slot: SlotId) -> Option<SlotCell> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slot.index().and_then(|i| slots.get(i)).cloned()
    }

    fn assigned(&self, slot: SlotId) -> Result<SlotCell, RemoteError> {
        self.cell(slot)
            .ok_or_else(|| RemoteError::protocol(format!("unknown slot {slot}")))
    }

    /// Answer one request. Never fails: every failure becomes an `error` response.
    pub async fn handle_request(&self, request: Request) -> Response {
        let id = request.invocation_id;
        let slot = request.slot;
        let action = request.action;
        let site = call_site(action, slot, &request.path);
        tracing::debug!(invocation_id = %id, %slot, %action, "Handling request");

        let outcome = AssertUnwindSafe(self.dispatch(request))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(invocation_id = %id, %slot, %action, %message, "Handler panicked");
                Err(RemoteError::error(format!("worker panicked: {message}"))
                    .with_stack(format!("panicked: {message}\n    {site}")))
            });

        match outcome {
            Ok(body) => Response {
                invocation_id: Some(id),
                body,
            },
            Err(error) => {
                tracing::debug!(invocation_id = %id, %slot, %action, %error, "Request failed");
                Response::error(id, error)
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<ResponseBody, RemoteError> {
        let Request {
            path,
            action,
            slot,
            args,
            ..
        } = request;

        let op = match action {
            Action::Read => Op::Read,
            Action::Write => Op::Write,
            Action::Has => Op::Has,
            Action::Call => Op::Call,
            Action::Construct => Op::Construct,
            Action::Destroy => return self.destroy(slot).await,
            Action::Unrecognized => return Err(RemoteError::protocol("unrecognized action")),
        };
        let cell = self.assigned(slot)?;

        // Held until the action has produced its answer.
        let entry = cell.read().await;
        let Some(root) = entry.clone() else {
            return Err(RemoteError::stale_reference(slot));
        };

        let (key, parents) = match path.split_last() {
            Some((key, parents)) => (Some(key), parents),
            None => (None, &path[..]),
        };
        let base = Base::walk(root, parents);

        match op {
            Op::Read => self.read(&base, key),
            Op::Write => self.write(&base, key, args),
            Op::Has => Ok(ResponseBody::Result(serde_json::Value::Bool(
                key.is_some_and(|key| has(&base, key)),
            ))),
            Op::Call => {
                let (target, this) = target(&base, key)?;
                let invocation = Invocation::new(this, args);
                let returned = target
                    .call(invocation)
                    .await
                    .map_err(|e| with_call_site(e, action, slot, &path))?;
                Ok(self.settle(returned))
            }
            Op::Construct => {
                let (target, _) = target(&base, key)?;
                let instance = target
                    .construct(args)
                    .await
                    .map_err(|e| with_call_site(e, action, slot, &path))?;
                Ok(self.settle(instance))
            }
        }
    }

    async fn destroy(&self, slot: SlotId) -> Result<ResponseBody, RemoteError> {
        let cell = self.assigned(slot)?;
        let mut entry = cell.write().await;
        if entry.take().is_some() {
            tracing::debug!(%slot, "Slot tombstoned");
        } else {
            tracing::trace!(%slot, "Destroy on tombstoned slot ignored");
        }
        Ok(ResponseBody::Result(serde_json::Value::Null))
    }

    fn read(&self, base: &Base, key: Option<&PropertyKey>) -> Result<ResponseBody, RemoteError> {
        let value = key.and_then(|key| base.member(key));
        Ok(match value {
            Some(property) => self.settle(property),
            None => ResponseBody::Result(serde_json::Value::Null),
        })
    }

    fn write(
        &self,
        base: &Base,
        key: Option<&PropertyKey>,
        args: Vec<serde_json::Value>,
    ) -> Result<ResponseBody, RemoteError> {
        let key = key.ok_or_else(|| RemoteError::type_error("write requires a member name"))?;
        let value = args.into_iter().next().unwrap_or(serde_json::Value::Null);
        match base {
            Base::Entity(entity) => {
                entity.set(key.clone(), Property::Value(value.clone()))?;
                Ok(self.settle(Property::Value(value)))
            }
            Base::Data(_) => Err(RemoteError::type_error(format!(
                "cannot assign to '{key}' on plain data"
            ))),
            Base::Missing => Err(RemoteError::type_error(format!(
                "cannot set properties of undefined (setting '{key}')"
            ))),
        }
    }

    /// Entities get a fresh slot and go back as a descriptor; data goes back as is.
    fn settle(&self, property: Property) -> ResponseBody {
        match property {
            Property::Value(value) => ResponseBody::Result(value),
            Property::Entity(entity) => ResponseBody::Exposed(vec![self.expose(entity)]),
        }
    }

    /// Run the worker event loop.
    ///
    /// Announces `roots`, then answers requests until the host closes the channel.
    pub async fn serve<R, W>(
        self: Arc<Self>,
        roots: Vec<Property>,
        channel: WorkerChannel<R, W>,
        config: WorkerConfig,
    ) -> Result<(), WorkerError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let WorkerChannel {
            mut reader,
            mut writer,
        } = channel;

        let roots = self.expose_roots(roots)?;
        tracing::info!(roots = roots.len(), "Announcing exposed roots");
        writer.send(Response::announcement(roots)).await?;

        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<Response>();
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        let mut handlers = JoinSet::new();

        let result = loop {
            tokio::select! {
                biased;

                Some(response) = response_rx.recv() => {
                    if let Err(e) = writer.send(response).await {
                        tracing::error!(error = %e, "Failed to send response");
                        break Err(e.into());
                    }
                }

                Some(joined) = handlers.join_next() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Request handler task failed");
                    }
                }

                inbound = reader.next() => {
                    match inbound {
                        Some(Ok(raw)) => {
                            let request = match parse_request(raw) {
                                Ok(request) => request,
                                Err(Some(rejection)) => {
                                    if let Err(e) = writer.send(rejection).await {
                                        tracing::error!(error = %e, "Failed to send protocol error");
                                        break Err(e.into());
                                    }
                                    continue;
                                }
                                Err(None) => continue,
                            };

                            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                                break Ok(());
                            };
                            let registry = Arc::clone(&self);
                            let tx = response_tx.clone();
                            handlers.spawn(async move {
                                let response = registry.handle_request(request).await;
                                drop(permit);
                                let _ = tx.send(response);
                            });
                        }
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Channel read error");
                            break Err(e.into());
                        }
                        None => {
                            tracing::info!("Channel closed by host");
                            break Ok(());
                        }
                    }
                }
            }
        };

        handlers.abort_all();
        tracing::info!(slots = self.len(), live = self.live_count(), "Worker exiting");
        result
    }
}

/// One stack frame naming where on the worker a request ran.
fn call_site(action: Action, slot: SlotId, path: &[PropertyKey]) -> String {
    let target = if path.is_empty() {
        "<self>".to_string()
    } else {
        path.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".")
    };
    format!("at {target} ({action}, slot {slot})")
}

/// Errors raised by exposed code carry no stack of their own; give them the call site.
fn with_call_site(
    error: RemoteError,
    action: Action,
    slot: SlotId,
    path: &[PropertyKey],
) -> RemoteError {
    if error.stack.is_some() {
        return error;
    }
    let site = call_site(action, slot, path);
    error.with_stack(site)
}

fn has(base: &Base, key: &PropertyKey) -> bool {
    match base {
        Base::Entity(entity) => entity.has(key),
        Base::Data(value) => data_member(value, key).is_some(),
        Base::Missing => false,
    }
}

/// The entity to call or construct, and the receiver to bind.
fn target(base: &Base, key: Option<&PropertyKey>) -> Result<(Entity, Option<Entity>), RemoteError> {
    let Some(key) = key else {
        return match base {
            Base::Entity(entity) => Ok((Arc::clone(entity), None)),
            _ => Err(RemoteError::type_error("target is not a function")),
        };
    };
    let receiver = match base {
        Base::Entity(entity) => Some(Arc::clone(entity)),
        _ => None,
    };
    match base.member(key) {
        Some(Property::Entity(entity)) => Ok((entity, receiver)),
        Some(Property::Value(_)) => Err(RemoteError::type_error(format!("{key} is not a function"))),
        None if matches!(base, Base::Missing) => Err(RemoteError::type_error(format!(
            "cannot read properties of undefined (reading '{key}')"
        ))),
        None => Err(RemoteError::type_error(format!("{key} is not a function"))),
    }
}

/// Decode an inbound frame.
///
/// `Err(Some(_))` is a protocol error to send back; `Err(None)` means the frame
/// carried no invocation id and is dropped.
fn parse_request(raw: serde_json::Value) -> Result<Request, Option<Response>> {
    let id = raw
        .get("invocationId")
        .and_then(serde_json::Value::as_u64)
        .map(InvocationId::new);

    serde_json::from_value::<Request>(raw).map_err(|e| match id {
        Some(id) => {
            tracing::warn!(invocation_id = %id, error = %e, "Malformed request");
            Some(Response::error(
                id,
                RemoteError::protocol(format!("malformed request: {e}")),
            ))
        }
        None => {
            tracing::warn!(error = %e, "Dropping frame without invocation id");
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::in_memory;
    use crate::descriptor::EntityKind;
    use crate::entity::{Class, Object};
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::time::Duration;

    fn calculator() -> Property {
        Object::named("calculator")
            .with("a", json!(1))
            .with("config", json!({"depth": 3, "modes": ["fast", "slow"]}))
            .with(
                "child",
                Object::named("child").with("leaf", json!("green")),
            )
            .method("b", |inv| async move {
                let x = inv.arg(0).as_i64().unwrap_or_default();
                Ok(json!(x * 2).into())
            })
            .method("lookup", |inv| async move {
                let index = inv.arg(0).as_i64().unwrap_or_default();
                if index < 0 {
                    return Err(RemoteError::range_error("bad index"));
                }
                Ok(json!(index).into())
            })
            .method("spawn_child", |_| async {
                Ok(Object::named("spawned").with("n", json!(7)).into())
            })
            .method("explode", |inv| async move {
                if inv.args().is_empty() {
                    panic!("kaboom");
                }
                Ok(Property::null())
            })
            .method("total", |inv| async move {
                let this = inv.receiver()?;
                let a = this
                    .get(&"a".into())
                    .and_then(|p| p.as_value().and_then(|v| v.as_i64()))
                    .unwrap_or_default();
                Ok(json!(a + inv.arg(0).as_i64().unwrap_or_default()).into())
            })
            .into()
    }

    fn point() -> Property {
        Class::new("Point", |inv| async move {
            let this = inv.receiver()?;
            for (i, name) in ["x", "y", "z"].iter().enumerate() {
                this.set((*name).into(), inv.arg(i).clone().into())?;
            }
            Ok(())
        })
        .into()
    }

    fn request(id: u64, slot: u64, action: Action, path: &[&str], args: Vec<serde_json::Value>) -> Request {
        Request {
            invocation_id: InvocationId::new(id),
            path: path.iter().map(|s| PropertyKey::decode(s)).collect(),
            action,
            slot: SlotId::new(slot),
            args,
        }
    }

    fn registry_with_roots() -> (Registry, Vec<Descriptor>) {
        let registry = Registry::new();
        let roots = registry.expose_roots(vec![calculator(), point()]).unwrap();
        (registry, roots)
    }

    fn result_of(response: Response) -> serde_json::Value {
        match response.body {
            ResponseBody::Result(value) => value,
            other => panic!("expected result, got {other:?}"),
        }
    }

    fn error_of(response: Response) -> RemoteError {
        match response.body {
            ResponseBody::Error(error) => error,
            other => panic!("expected error, got {other:?}"),
        }
    }

    fn exposed_of(response: Response) -> Vec<Descriptor> {
        match response.body {
            ResponseBody::Exposed(descriptors) => descriptors,
            other => panic!("expected exposed, got {other:?}"),
        }
    }

    #[test]
    fn roots_get_consecutive_slots() {
        let (registry, roots) = registry_with_roots();
        assert_eq!(roots[0].slot, SlotId::new(0));
        assert_eq!(roots[0].kind, EntityKind::Object);
        assert_eq!(roots[1].slot, SlotId::new(1));
        assert_eq!(roots[1].kind, EntityKind::Class);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn plain_data_roots_are_rejected() {
        let registry = Registry::new();
        let err = registry
            .expose_roots(vec![calculator(), json!(5).into()])
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Validation {
                kind: MemberKind::Number
            }
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn read_data_and_call_method() {
        let (registry, _) = registry_with_roots();

        let a = registry.handle_request(request(1, 0, Action::Read, &["a"], vec![])).await;
        assert_eq!(a.invocation_id, Some(InvocationId::new(1)));
        assert_eq!(result_of(a), json!(1));

        let b = registry
            .handle_request(request(2, 0, Action::Call, &["b"], vec![json!(21)]))
            .await;
        assert_eq!(result_of(b), json!(42));
    }

    #[tokio::test]
    async fn methods_receive_their_object() {
        let (registry, _) = registry_with_roots();
        let out = registry
            .handle_request(request(1, 0, Action::Call, &["total"], vec![json!(10)]))
            .await;
        assert_eq!(result_of(out), json!(11));
    }

    #[tokio::test]
    async fn reading_an_entity_exposes_it_in_a_new_slot() {
        let (registry, _) = registry_with_roots();

        let first = exposed_of(registry.handle_request(request(1, 0, Action::Read, &["child"], vec![])).await);
        let second = exposed_of(registry.handle_request(request(2, 0, Action::Read, &["child"], vec![])).await);

        assert_eq!(first[0].slot, SlotId::new(2));
        assert_eq!(second[0].slot, SlotId::new(3));
        assert_eq!(first[0].name, "child");
        assert_eq!(first[0].members[0].name, PropertyKey::name("leaf"));
    }

    #[tokio::test]
    async fn paths_walk_through_entities_and_data() {
        let (registry, _) = registry_with_roots();

        let leaf = registry
            .handle_request(request(1, 0, Action::Read, &["child", "leaf"], vec![]))
            .await;
        assert_eq!(result_of(leaf), json!("green"));

        let depth = registry
            .handle_request(request(2, 0, Action::Read, &["config", "depth"], vec![]))
            .await;
        assert_eq!(result_of(depth), json!(3));

        let mode = registry
            .handle_request(request(3, 0, Action::Read, &["config", "modes", "1"], vec![]))
            .await;
        assert_eq!(result_of(mode), json!("slow"));
    }

    #[tokio::test]
    async fn missing_intermediate_short_circuits() {
        let (registry, _) = registry_with_roots();

        let read = registry
            .handle_request(request(1, 0, Action::Read, &["nope", "deeper", "leaf"], vec![]))
            .await;
        assert_eq!(result_of(read), json!(null));

        let has = registry
            .handle_request(request(2, 0, Action::Has, &["nope", "leaf"], vec![]))
            .await;
        assert_eq!(result_of(has), json!(false));

        let write = registry
            .handle_request(request(3, 0, Action::Write, &["nope", "leaf"], vec![json!(1)]))
            .await;
        assert_eq!(error_of(write).kind, ErrorKind::TypeError);

        let call = registry
            .handle_request(request(4, 0, Action::Call, &["nope", "f"], vec![]))
            .await;
        assert_eq!(error_of(call).kind, ErrorKind::TypeError);
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let (registry, _) = registry_with_roots();

        let written = registry
            .handle_request(request(1, 0, Action::Write, &["a"], vec![json!(99)]))
            .await;
        assert_eq!(result_of(written), json!(99));

        let has = registry
            .handle_request(request(2, 0, Action::Has, &["fresh"], vec![]))
            .await;
        assert_eq!(result_of(has), json!(false));

        registry
            .handle_request(request(3, 0, Action::Write, &["fresh"], vec![json!("new")]))
            .await;
        let read = registry
            .handle_request(request(4, 0, Action::Read, &["fresh"], vec![]))
            .await;
        assert_eq!(result_of(read), json!("new"));
    }

    #[tokio::test]
    async fn thrown_errors_are_marshaled() {
        let (registry, _) = registry_with_roots();
        let response = registry
            .handle_request(request(1, 0, Action::Call, &["lookup"], vec![json!(-1)]))
            .await;
        let error = error_of(response);
        assert_eq!(error.kind, ErrorKind::RangeError);
        assert_eq!(error.message, "bad index");
        assert_eq!(error.stack.as_deref(), Some("at lookup (call, slot 0)"));
    }

    #[tokio::test]
    async fn panicking_handler_is_answered() {
        let (registry, _) = registry_with_roots();
        let response = registry
            .handle_request(request(1, 0, Action::Call, &["explode"], vec![]))
            .await;
        let error = error_of(response);
        assert_eq!(error.kind, ErrorKind::Error);
        assert_eq!(error.message, "worker panicked: kaboom");
        assert_eq!(
            error.stack.as_deref(),
            Some("panicked: kaboom\n    at explode (call, slot 0)")
        );

        let again = registry
            .handle_request(request(2, 0, Action::Read, &["a"], vec![]))
            .await;
        assert_eq!(result_of(again), json!(1));
    }

    #[tokio::test]
    async fn calling_data_or_class_is_a_type_error() {
        let (registry, _) = registry_with_roots();

        let data = registry
            .handle_request(request(1, 0, Action::Call, &["a"], vec![]))
            .await;
        assert_eq!(error_of(data).message, "a is not a function");

        let class = registry.handle_request(request(2, 1, Action::Call, &[], vec![])).await;
        assert_eq!(
            error_of(class).message,
            "Class constructor Point cannot be invoked without 'new'"
        );
    }

    #[tokio::test]
    async fn construct_exposes_instance_with_constructor_members() {
        let (registry, _) = registry_with_roots();
        let response = registry
            .handle_request(request(1, 1, Action::Construct, &[], vec![json!(1), json!(2), json!(3)]))
            .await;
        let instance = exposed_of(response).remove(0);

        assert_eq!(instance.kind, EntityKind::Object);
        assert_eq!(instance.name, "Point");
        let names: Vec<_> = instance.members.iter().map(|m| m.name.encode()).collect();
        assert_eq!(names, vec!["x", "y", "z"]);

        let y = registry
            .handle_request(request(2, instance.slot.get(), Action::Read, &["y"], vec![]))
            .await;
        assert_eq!(result_of(y), json!(2));
    }

    #[tokio::test]
    async fn nested_entities_returned_from_calls_are_exposed() {
        let (registry, _) = registry_with_roots();
        let spawned = exposed_of(
            registry
                .handle_request(request(1, 0, Action::Call, &["spawn_child"], vec![]))
                .await,
        );
        assert_eq!(spawned[0].name, "spawned");
        assert_eq!(spawned[0].slot, SlotId::new(2));
    }

    #[tokio::test]
    async fn destroyed_slot_rejects_everything_but_destroy() {
        let (registry, _) = registry_with_roots();

        let ack = registry.handle_request(request(1, 0, Action::Destroy, &[], vec![])).await;
        assert_eq!(result_of(ack), json!(null));
        assert!(!registry.is_live(SlotId::new(0)));
        assert!(registry.is_live(SlotId::new(1)));

        let actions = [
            (Action::Read, vec![]),
            (Action::Write, vec![json!(1)]),
            (Action::Has, vec![]),
            (Action::Call, vec![]),
            (Action::Construct, vec![]),
        ];
        for (i, (action, args)) in actions.into_iter().enumerate() {
            let response = registry
                .handle_request(request(10 + i as u64, 0, action, &["b"], args))
                .await;
            let error = error_of(response);
            assert_eq!(error.kind, ErrorKind::StaleReferenceError, "{action}");
        }

        let again = registry.handle_request(request(20, 0, Action::Destroy, &[], vec![])).await;
        assert_eq!(result_of(again), json!(null));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn unknown_slot_and_action_are_protocol_errors() {
        let (registry, _) = registry_with_roots();

        let unknown = registry.handle_request(request(1, 42, Action::Read, &["a"], vec![])).await;
        assert_eq!(error_of(unknown).kind, ErrorKind::ProtocolError);

        let huge = registry
            .handle_request(request(3, u64::MAX, Action::Read, &["a"], vec![]))
            .await;
        assert_eq!(error_of(huge).kind, ErrorKind::ProtocolError);

        let destroy_unknown = registry
            .handle_request(request(4, 42, Action::Destroy, &[], vec![]))
            .await;
        assert_eq!(error_of(destroy_unknown).kind, ErrorKind::ProtocolError);

        let odd = registry
            .handle_request(request(2, 0, Action::Unrecognized, &["a"], vec![]))
            .await;
        assert_eq!(error_of(odd).kind, ErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn destroy_waits_for_in_flight_call_on_same_slot() {
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let (s, r) = (Arc::clone(&started), Arc::clone(&release));
        let slow = Object::new()
            .method("slow", move |_| {
                let (s, r) = (Arc::clone(&s), Arc::clone(&r));
                async move {
                    s.notify_one();
                    r.notified().await;
                    Ok(json!("finished").into())
                }
            })
            .into();

        let registry = Arc::new(Registry::new());
        registry.expose_roots(vec![slow]).unwrap();

        let call = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move {
                registry
                    .handle_request(request(1, 0, Action::Call, &["slow"], vec![]))
                    .await
            }
        });
        started.notified().await;

        let destroy = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move {
                registry
                    .handle_request(request(2, 0, Action::Destroy, &[], vec![]))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!destroy.is_finished());

        release.notify_one();
        assert_eq!(result_of(call.await.unwrap()), json!("finished"));
        assert_eq!(result_of(destroy.await.unwrap()), json!(null));
        assert!(!registry.is_live(SlotId::new(0)));
    }

    #[tokio::test]
    async fn serve_announces_and_answers() {
        let (mut host, worker) = in_memory(64 * 1024);
        let registry = Arc::new(Registry::new());
        let server = tokio::spawn(Arc::clone(&registry).serve(
            vec![calculator()],
            worker,
            WorkerConfig::default(),
        ));

        let raw = host.reader.next().await.unwrap().unwrap();
        let announcement = Response::from_json(raw).unwrap();
        assert!(announcement.is_announcement());
        assert_eq!(exposed_of(announcement)[0].name, "calculator");

        host.writer
            .send(request(1, 0, Action::Call, &["b"], vec![json!(4)]))
            .await
            .unwrap();
        let raw = host.reader.next().await.unwrap().unwrap();
        let answer = Response::from_json(raw).unwrap();
        assert_eq!(answer.invocation_id, Some(InvocationId::new(1)));
        assert_eq!(result_of(answer), json!(8));

        drop(host);
        server.await.unwrap().unwrap();
    }

    #[test]
    fn malformed_request_with_id_is_answered() {
        let rejection = parse_request(json!({"invocationId": 5, "action": "read"})).unwrap_err();
        let response = rejection.expect("id is recoverable");
        assert_eq!(response.invocation_id, Some(InvocationId::new(5)));
        assert_eq!(error_of(response).kind, ErrorKind::ProtocolError);

        assert!(parse_request(json!({"hello": "world"})).unwrap_err().is_none());
    }

    #[test]
    fn config_defaults_and_floor() {
        assert_eq!(WorkerConfig::default().max_in_flight, 64);
        assert_eq!(WorkerConfig::new().with_max_in_flight(0).max_in_flight, 1);
    }
}
