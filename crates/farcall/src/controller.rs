//! Host controller - issues requests and correlates responses.
//!
//! ```text
//!   StandIn ──request()──► outbound mpsc ──► writer task ──► channel ──► worker
//!      ▲                                                                   │
//!      └──── oneshot ◄── pending table ◄── reader task ◄── channel ◄───────┘
//! ```
//!
//! Every request gets a fresh invocation id and a pending entry holding the
//! completion. The reader task removes the entry when the matching response
//! arrives, so each id settles at most once; anything arriving for an id that
//! is no longer pending is logged and dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::channel::HostChannel;
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    Action, InvocationId, MalformedResponse, PropertyKey, Request, Response, ResponseBody, SlotId,
};
use crate::descriptor::Descriptor;
use crate::error::HostError;
use crate::lifecycle::{Backoff, LivenessTracker};
use crate::stand_in::StandIn;

const CONNECT_TIMEOUT_ENV: &str = "FARCALL_CONNECT_TIMEOUT_MS";
const TEARDOWN_TIMEOUT_ENV: &str = "FARCALL_TEARDOWN_TIMEOUT_MS";

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How long to wait for the worker's root announcement.
    pub connect_timeout: Duration,
    /// How long teardown waits for in-flight requests before rejecting them.
    pub teardown_timeout: Duration,
    pub poll_initial: Duration,
    pub poll_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(5),
            poll_initial: Duration::from_millis(5),
            poll_max: Duration::from_millis(200),
        }
    }
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, overridden by `FARCALL_CONNECT_TIMEOUT_MS` and
    /// `FARCALL_TEARDOWN_TIMEOUT_MS` when they hold a number of milliseconds.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = millis_from_env(CONNECT_TIMEOUT_ENV) {
            config.connect_timeout = ms;
        }
        if let Some(ms) = millis_from_env(TEARDOWN_TIMEOUT_ENV) {
            config.teardown_timeout = ms;
        }
        config
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_initial = initial;
        self.poll_max = max;
        self
    }
}

fn millis_from_env(var: &str) -> Option<Duration> {
    let raw = std::env::var(var).ok()?;
    parse_millis(var, &raw)
}

fn parse_millis(var: &str, raw: &str) -> Option<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            tracing::warn!(var, value = raw, error = %e, "Ignoring invalid timeout override");
            None
        }
    }
}

/// A settled reply on its way from the reader task to the caller.
enum Delivery {
    Value(serde_json::Value),
    Exposed(Unclaimed),
}

type Outcome = Result<Delivery, HostError>;

/// Descriptors of slots the worker just created for a reply.
///
/// Until the caller claims them they belong to nobody on the host, so dropping
/// them unclaimed (caller gave up, reply discarded) destroys the slots.
struct Unclaimed {
    descriptors: Vec<Descriptor>,
    shared: Weak<Shared>,
}

impl Unclaimed {
    fn claim(mut self) -> Vec<Descriptor> {
        std::mem::take(&mut self.descriptors)
    }
}

impl Drop for Unclaimed {
    fn drop(&mut self) {
        if self.descriptors.is_empty() {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        for descriptor in self.descriptors.drain(..) {
            let slot = descriptor.slot;
            match shared.send(Vec::new(), Action::Destroy, slot, Vec::new()) {
                Ok(_) => tracing::debug!(%slot, "Released slot nobody claimed"),
                Err(_) => tracing::trace!(%slot, "Controller closed, unclaimed slot not released"),
            }
        }
    }
}

struct PendingInvocation {
    completion: oneshot::Sender<Outcome>,
    sent_at: Instant,
    action: Action,
    slot: SlotId,
}

/// State shared between the controller and its reader and writer tasks.
struct Shared {
    next_id: AtomicU64,
    pending: DashMap<InvocationId, PendingInvocation>,
    closing: AtomicBool,
    /// Weak so the writer task exits once the controller itself is gone.
    outbound: mpsc::WeakUnboundedSender<Request>,
}

impl Shared {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn send(
        &self,
        path: Vec<PropertyKey>,
        action: Action,
        slot: SlotId,
        args: Vec<serde_json::Value>,
    ) -> Result<oneshot::Receiver<Outcome>, HostError> {
        if self.is_closing() {
            return Err(HostError::Disconnected);
        }
        let Some(outbound) = self.outbound.upgrade() else {
            return Err(HostError::Disconnected);
        };

        let id = InvocationId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (completion, receiver) = oneshot::channel();
        self.pending.insert(
            id,
            PendingInvocation {
                completion,
                sent_at: Instant::now(),
                action,
                slot,
            },
        );

        // Teardown may have started between the check above and the insert.
        if self.is_closing() {
            self.pending.remove(&id);
            return Err(HostError::Disconnected);
        }

        tracing::debug!(invocation_id = %id, %slot, %action, "Sending request");
        let request = Request {
            invocation_id: id,
            path,
            action,
            slot,
            args,
        };
        if outbound.send(request).is_err() {
            self.pending.remove(&id);
            return Err(HostError::Disconnected);
        }
        Ok(receiver)
    }

    fn route(self: &Arc<Self>, response: Response) {
        let Some(id) = response.invocation_id else {
            tracing::warn!("Ignoring announcement received after connect");
            return;
        };

        let Some((_, invocation)) = self.pending.remove(&id) else {
            tracing::debug!(invocation_id = %id, "Discarding response for unknown or settled invocation");
            return;
        };

        tracing::trace!(
            invocation_id = %id,
            slot = %invocation.slot,
            action = %invocation.action,
            elapsed_ms = invocation.sent_at.elapsed().as_millis() as u64,
            "Response received"
        );

        let outcome = match response.body {
            ResponseBody::Error(error) => Err(HostError::from_remote(error)),
            ResponseBody::Result(value) => Ok(Delivery::Value(value)),
            ResponseBody::Exposed(descriptors) => Ok(Delivery::Exposed(Unclaimed {
                descriptors,
                shared: Arc::downgrade(self),
            })),
        };
        // A refused outcome is dropped here, which releases any unclaimed slots.
        if invocation.completion.send(outcome).is_err() {
            tracing::trace!(invocation_id = %id, "Caller no longer waiting");
        }
    }

    /// Fail the one invocation a malformed frame names, if any.
    fn reject_malformed(&self, malformed: MalformedResponse) {
        let Some(id) = malformed.invocation_id else {
            tracing::warn!(reason = %malformed.reason, "Dropping malformed frame without invocation id");
            return;
        };
        let Some((_, invocation)) = self.pending.remove(&id) else {
            tracing::debug!(invocation_id = %id, reason = %malformed.reason, "Discarding malformed response for unknown invocation");
            return;
        };
        tracing::warn!(invocation_id = %id, slot = %invocation.slot, reason = %malformed.reason, "Malformed response");
        let _ = invocation
            .completion
            .send(Err(HostError::Protocol(malformed.to_string())));
    }

    /// Settle every pending invocation with `error`. Returns how many there were.
    fn reject_all(&self, error: HostError) -> usize {
        let ids: Vec<InvocationId> = self.pending.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|(id, invocation)| {
                tracing::debug!(invocation_id = %id, slot = %invocation.slot, %error, "Rejecting pending invocation");
                let _ = invocation.completion.send(Err(error.clone()));
            })
            .count()
    }
}

/// Outcome of tearing the controller down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    /// Whether every in-flight request settled before the deadline.
    pub drained: bool,
    /// Pending invocations rejected by the teardown itself.
    pub rejected: usize,
}

/// Reply to a request, before the caller picks the shape it expects.
#[derive(Debug)]
pub enum Reply {
    Value(serde_json::Value),
    Exposed(Vec<StandIn>),
}

impl Reply {
    pub fn into_value(self) -> Result<serde_json::Value, HostError> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Exposed(_) => Err(HostError::UnexpectedReply { expected: "a value" }),
        }
    }

    pub fn into_stand_in(self) -> Result<StandIn, HostError> {
        match self {
            Self::Exposed(mut stand_ins) if stand_ins.len() == 1 => Ok(stand_ins.remove(0)),
            _ => Err(HostError::UnexpectedReply {
                expected: "a single exposed entity",
            }),
        }
    }

    pub fn into_stand_ins(self) -> Result<Vec<StandIn>, HostError> {
        match self {
            Self::Exposed(stand_ins) => Ok(stand_ins),
            Self::Value(_) => Err(HostError::UnexpectedReply {
                expected: "exposed entities",
            }),
        }
    }

    pub fn is_exposed(&self) -> bool {
        matches!(self, Self::Exposed(_))
    }
}

/// A connected controller and the stand-ins for the worker's roots.
#[derive(Debug)]
pub struct Connected {
    pub controller: Arc<Controller>,
    pub roots: Vec<StandIn>,
}

impl Connected {
    /// The root whose descriptor carries `name`.
    pub fn root(&self, name: &str) -> Option<&StandIn> {
        self.roots.iter().find(|root| root.name() == name)
    }
}

pub struct Controller {
    shared: Arc<Shared>,
    /// Sole strong handle on the outbound queue; the writer task drains and
    /// closes the channel once it is dropped.
    _outbound: mpsc::UnboundedSender<Request>,
    tracker: LivenessTracker,
    shutdown: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    config: ControllerConfig,
}

impl Controller {
    /// Wait for the worker's announcement, then start routing.
    pub async fn connect<R, W>(
        channel: HostChannel<R, W>,
        config: ControllerConfig,
    ) -> Result<Connected, HostError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let HostChannel { mut reader, writer } = channel;

        tracing::debug!("Waiting for root announcement from worker");
        let announced = tokio::time::timeout(config.connect_timeout, async {
            loop {
                match reader.next().await {
                    Some(Ok(raw)) => match Response::from_json(raw) {
                        Ok(Response {
                            invocation_id: None,
                            body: ResponseBody::Exposed(roots),
                        }) => return Ok(roots),
                        Ok(other) => {
                            tracing::warn!(?other, "Unexpected message before announcement");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Malformed message before announcement");
                        }
                    },
                    Some(Err(e)) => {
                        return Err(HostError::Protocol(format!("channel error: {e}")));
                    }
                    None => return Err(HostError::Disconnected),
                }
            }
        })
        .await;

        let roots = match announced {
            Ok(roots) => roots?,
            Err(_) => return Err(HostError::ConnectTimeout(config.connect_timeout)),
        };
        tracing::info!(roots = roots.len(), "Worker announced roots");

        let shutdown = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            closing: AtomicBool::new(false),
            outbound: outbound.downgrade(),
        });

        let writer_task = tokio::spawn(write_loop(
            writer,
            outbound_rx,
            Arc::clone(&shared),
            shutdown.clone(),
        ));
        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&shared), shutdown.clone()));

        let controller = Arc::new(Controller {
            shared,
            _outbound: outbound,
            tracker: LivenessTracker::new(),
            shutdown,
            tasks: StdMutex::new(vec![writer_task, reader_task]),
            config,
        });

        let roots = roots
            .into_iter()
            .map(|descriptor| StandIn::new(Arc::clone(&controller), descriptor))
            .collect();

        Ok(Connected { controller, roots })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Requests sent and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closing()
    }

    /// Slots the host still holds stand-ins for.
    pub fn live_slots(&self) -> Vec<SlotId> {
        self.tracker.live()
    }

    pub(crate) fn tracker(&self) -> &LivenessTracker {
        &self.tracker
    }

    /// Send one request and wait for its reply.
    pub async fn request(
        self: &Arc<Self>,
        path: Vec<PropertyKey>,
        action: Action,
        slot: SlotId,
        args: Vec<serde_json::Value>,
    ) -> Result<Reply, HostError> {
        let completion = self.shared.send(path, action, slot, args)?;
        let delivery = completion.await.map_err(|_| HostError::Disconnected)??;

        Ok(match delivery {
            Delivery::Value(value) => Reply::Value(value),
            Delivery::Exposed(unclaimed) => Reply::Exposed(self.adopt(unclaimed.claim())),
        })
    }

    fn adopt(self: &Arc<Self>, descriptors: Vec<Descriptor>) -> Vec<StandIn> {
        descriptors
            .into_iter()
            .map(|descriptor| StandIn::new(Arc::clone(self), descriptor))
            .collect()
    }

    /// Fire-and-forget destroy for a slot the host no longer references.
    pub(crate) fn release_slot(&self, slot: SlotId) {
        if !self.tracker.untrack(slot) {
            return;
        }
        match self.shared.send(Vec::new(), Action::Destroy, slot, Vec::new()) {
            Ok(_) => tracing::trace!(%slot, "Released slot"),
            Err(_) => tracing::trace!(%slot, "Controller closed, slot not released"),
        }
    }

    /// Wait until nothing is in flight or `deadline` passes. Returns whether it drained.
    pub async fn drain(&self, deadline: Instant) -> bool {
        let mut backoff = Backoff::new(self.config.poll_initial, self.config.poll_max);
        loop {
            if self.shared.pending.is_empty() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let delay = backoff.next_delay().min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    /// Destroy `slot`, then tear the whole controller down.
    pub async fn terminate_from(&self, slot: SlotId) -> Teardown {
        self.release_slot(slot);
        self.teardown().await
    }

    /// Tear down without destroying anything on the worker.
    pub async fn shutdown(&self) -> Teardown {
        self.teardown().await
    }

    async fn teardown(&self) -> Teardown {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            tracing::debug!("Teardown already started");
            return Teardown {
                drained: self.shared.pending.is_empty(),
                rejected: 0,
            };
        }

        let in_flight = self.shared.pending.len();
        tracing::info!(in_flight, "Tearing down controller");

        let deadline = Instant::now() + self.config.teardown_timeout;
        let drained = self.drain(deadline).await;

        let mut rejected = 0;
        if !drained {
            rejected = self.shared.reject_all(HostError::Timeout);
            tracing::warn!(
                rejected,
                timeout_ms = self.config.teardown_timeout.as_millis() as u64,
                "Teardown deadline elapsed with requests in flight"
            );
        }

        self.shutdown.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Channel task failed");
            }
        }
        rejected += self.shared.reject_all(HostError::Disconnected);

        tracing::info!(drained, rejected, "Controller torn down");
        Teardown { drained, rejected }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("in_flight", &self.shared.pending.len())
            .field("live_slots", &self.tracker.len())
            .field("closed", &self.shared.is_closing())
            .finish()
    }
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, JsonCodec<Request>>,
    mut outbound: mpsc::UnboundedReceiver<Request>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            next = outbound.recv() => {
                let Some(request) = next else {
                    tracing::debug!("Controller dropped, closing channel");
                    break;
                };
                let id = request.invocation_id;
                if let Err(e) = writer.send(request).await {
                    tracing::error!(invocation_id = %id, error = %e, "Failed to send request");
                    shared.closing.store(true, Ordering::SeqCst);
                    shared.reject_all(HostError::Disconnected);
                    break;
                }
            }
        }
    }

    if let Err(e) = writer.close().await {
        tracing::debug!(error = %e, "Error closing channel writer");
    }
    tracing::debug!("Writer task exiting");
}

async fn read_loop<R>(
    mut reader: FramedRead<R, JsonCodec<serde_json::Value>>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            frame = reader.next() => match frame {
                Some(Ok(raw)) => match Response::from_json(raw) {
                    Ok(response) => shared.route(response),
                    Err(malformed) => shared.reject_malformed(malformed),
                },
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Channel read error");
                    break;
                }
                None => {
                    tracing::info!("Channel closed by worker");
                    break;
                }
            }
        }
    }

    shared.closing.store(true, Ordering::SeqCst);
    let rejected = shared.reject_all(HostError::Disconnected);
    if rejected > 0 {
        tracing::warn!(rejected, "Rejected pending invocations after channel closed");
    }
    tracing::debug!("Reader task exiting");
}
