//! farcall: drive objects living in an isolated worker from a host, over a message channel.
//!
//! The worker exposes functions, classes and objects through a [`Registry`];
//! the host connects a [`Controller`] and gets a [`StandIn`] per exposed root.
//! Data crosses the channel as JSON, everything else by slot reference.

pub mod bridge;
pub mod controller;
pub mod descriptor;
pub mod entity;
pub mod error;
pub mod lifecycle;
mod logging;
pub mod registry;
pub mod stand_in;

pub use bridge::channel::{HostChannel, WorkerChannel, in_memory};
pub use bridge::protocol::{Action, InvocationId, PropertyKey, SlotId};
pub use controller::{Connected, Controller, ControllerConfig, Reply, Teardown};
pub use descriptor::{Descriptor, EntityKind, MemberDescriptor, MemberKind};
pub use entity::{Class, Entity, Exposed, Function, Invocation, Object, Property};
pub use error::{ErrorKind, HostError, RemoteError, WorkerError};
pub use logging::init_tracing;
pub use registry::{Registry, WorkerConfig};
pub use stand_in::{Field, Method, StandIn};
