//! Host-side proxy for an exposed entity.
//!
//! A [`StandIn`] is cheap to clone; all clones share one slot. When the last
//! clone is dropped the slot is released with a fire-and-forget `destroy`,
//! unless it was already released explicitly.

use std::fmt;
use std::sync::Arc;

use crate::bridge::protocol::{Action, PropertyKey, SlotId};
use crate::controller::{Controller, Reply, Teardown};
use crate::descriptor::{Descriptor, EntityKind, MemberDescriptor};
use crate::error::HostError;

struct Inner {
    controller: Arc<Controller>,
    descriptor: Descriptor,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.controller.release_slot(self.descriptor.slot);
    }
}

#[derive(Clone)]
pub struct StandIn {
    inner: Arc<Inner>,
}

impl StandIn {
    pub(crate) fn new(controller: Arc<Controller>, descriptor: Descriptor) -> Self {
        controller.tracker().track(descriptor.slot);
        Self {
            inner: Arc::new(Inner {
                controller,
                descriptor,
            }),
        }
    }

    pub fn slot(&self) -> SlotId {
        self.inner.descriptor.slot
    }

    pub fn name(&self) -> &str {
        &self.inner.descriptor.name
    }

    pub fn kind(&self) -> EntityKind {
        self.inner.descriptor.kind
    }

    /// The descriptor as announced. Not refreshed afterwards.
    pub fn descriptor(&self) -> &Descriptor {
        &self.inner.descriptor
    }

    pub fn members(&self) -> &[MemberDescriptor] {
        &self.inner.descriptor.members
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.inner.controller
    }

    /// Whether the host still holds this slot, i.e. it has not been released.
    pub fn is_live(&self) -> bool {
        self.inner.controller.tracker().is_tracked(self.slot())
    }

    async fn request(
        &self,
        path: Vec<PropertyKey>,
        action: Action,
        args: Vec<serde_json::Value>,
    ) -> Result<Reply, HostError> {
        self.inner
            .controller
            .request(path, action, self.slot(), args)
            .await
    }

    pub async fn get_member(&self, name: impl Into<PropertyKey>) -> Result<Reply, HostError> {
        self.request(vec![name.into()], Action::Read, Vec::new()).await
    }

    /// Read through a chain of members, e.g. `["config", "depth"]`.
    pub async fn read_path<I, K>(&self, path: I) -> Result<Reply, HostError>
    where
        I: IntoIterator<Item = K>,
        K: Into<PropertyKey>,
    {
        let path = path.into_iter().map(Into::into).collect();
        self.request(path, Action::Read, Vec::new()).await
    }

    /// Assign a data member. Resolves to the value the worker stored.
    pub async fn set_member(
        &self,
        name: impl Into<PropertyKey>,
        value: serde_json::Value,
    ) -> Result<serde_json::Value, HostError> {
        self.request(vec![name.into()], Action::Write, vec![value])
            .await?
            .into_value()
    }

    pub async fn has_member(&self, name: impl Into<PropertyKey>) -> Result<bool, HostError> {
        self.request(vec![name.into()], Action::Has, Vec::new())
            .await?
            .into_value()?
            .as_bool()
            .ok_or(HostError::UnexpectedReply {
                expected: "a boolean",
            })
    }

    pub async fn call_member(
        &self,
        name: impl Into<PropertyKey>,
        args: Vec<serde_json::Value>,
    ) -> Result<Reply, HostError> {
        self.request(vec![name.into()], Action::Call, args).await
    }

    /// Call the entity itself.
    pub async fn call(&self, args: Vec<serde_json::Value>) -> Result<Reply, HostError> {
        self.request(Vec::new(), Action::Call, args).await
    }

    pub async fn construct(&self, args: Vec<serde_json::Value>) -> Result<Reply, HostError> {
        self.request(Vec::new(), Action::Construct, args).await
    }

    pub async fn construct_member(
        &self,
        name: impl Into<PropertyKey>,
        args: Vec<serde_json::Value>,
    ) -> Result<Reply, HostError> {
        self.request(vec![name.into()], Action::Construct, args).await
    }

    /// Forwarding method for a member the descriptor lists as callable.
    pub fn method(&self, name: impl Into<PropertyKey>) -> Option<Method> {
        let name = name.into();
        self.inner
            .descriptor
            .member(&name)
            .filter(|member| member.kind.is_callable())
            .map(|_| Method {
                target: self.clone(),
                name,
            })
    }

    /// Lazy accessor for a member the descriptor lists as data or as a non-callable entity.
    pub fn field(&self, name: impl Into<PropertyKey>) -> Option<Field> {
        let name = name.into();
        self.inner
            .descriptor
            .member(&name)
            .filter(|member| !member.kind.is_callable())
            .map(|_| Field {
                target: self.clone(),
                name,
            })
    }

    /// Destroy the slot now and wait for the worker to acknowledge.
    ///
    /// Other clones stay usable as handles but every operation through them
    /// fails with a stale reference. Releasing twice is a no-op.
    pub async fn release(&self) -> Result<(), HostError> {
        let slot = self.slot();
        if !self.inner.controller.tracker().untrack(slot) {
            return Ok(());
        }
        tracing::debug!(%slot, "Releasing slot");
        self.inner
            .controller
            .request(Vec::new(), Action::Destroy, slot, Vec::new())
            .await?
            .into_value()?;
        Ok(())
    }

    /// Destroy this slot, then tear down the controller and channel.
    ///
    /// Never hangs: requests still in flight after the teardown timeout are
    /// rejected with [`HostError::Timeout`].
    pub async fn terminate(&self) -> Teardown {
        self.inner.controller.terminate_from(self.slot()).await
    }
}

impl fmt::Debug for StandIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandIn")
            .field("slot", &self.slot())
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// A callable member bound to its stand-in.
#[derive(Clone, Debug)]
pub struct Method {
    target: StandIn,
    name: PropertyKey,
}

impl Method {
    pub fn name(&self) -> &PropertyKey {
        &self.name
    }

    pub async fn call(&self, args: Vec<serde_json::Value>) -> Result<Reply, HostError> {
        self.target.call_member(self.name.clone(), args).await
    }
}

/// A data member read and written on demand.
#[derive(Clone, Debug)]
pub struct Field {
    target: StandIn,
    name: PropertyKey,
}

impl Field {
    pub fn name(&self) -> &PropertyKey {
        &self.name
    }

    pub async fn get(&self) -> Result<Reply, HostError> {
        self.target.get_member(self.name.clone()).await
    }

    pub async fn set(&self, value: serde_json::Value) -> Result<serde_json::Value, HostError> {
        self.target.set_member(self.name.clone(), value).await
    }
}
