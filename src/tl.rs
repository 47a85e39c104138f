//! The transport-driver contract.
//!
//! A *component* names one transport and enumerates its (transport, device)
//! resources; the worker opens one *interface* per selected resource and
//! talks to it exclusively through the traits here. Addresses and remote
//! keys cross this boundary as opaque byte blobs, the core never looks
//! inside them.

use crate::am::{AmCallback, AmId, AmKind, AmTable};
use crate::async_ctx::AsyncNotifier;
use crate::status::Result;
use crate::sys::CpuSet;

pub mod loopback;

/// Dense index of a (transport, device) resource within a worker,
/// `[0, num_tls)`.
///
/// Small enough to be encoded into per-endpoint lane fields.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RscIndex(pub u8);

impl RscIndex {
    /// The resource's bit in selection masks such as `atomic_tls`.
    pub fn bit(self) -> u64 {
        1u64 << self.0
    }
}

/// Immutable description of one transport resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDesc {
    /// Transport name, e.g. `loopback`.
    pub tl_name: String,
    /// Device name within the transport.
    pub dev_name: String,
    /// Index of the owning memory domain.
    pub md_index: usize,
    /// Whether the memory domain supports memory registration.
    pub md_supports_reg: bool,
}

bitflags::bitflags! {
    /// Operations and properties an opened interface advertises.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IfaceFlags: u64 {
        const AM_SHORT = 1 << 0;
        const AM_BCOPY = 1 << 1;
        const AM_ZCOPY = 1 << 2;
        /// AM callbacks may run from the progress thread.
        const AM_CB_SYNC = 1 << 3;
        /// AM callbacks may run from a transport-owned thread.
        const AM_CB_ASYNC = 1 << 4;
        const PUT_SHORT = 1 << 5;
        const PUT_BCOPY = 1 << 6;
        const PUT_ZCOPY = 1 << 7;
        const GET_BCOPY = 1 << 8;
        const GET_ZCOPY = 1 << 9;
        const ATOMIC_ADD32 = 1 << 10;
        const ATOMIC_ADD64 = 1 << 11;
        const ATOMIC_FADD32 = 1 << 12;
        const ATOMIC_FADD64 = 1 << 13;
        const ATOMIC_SWAP32 = 1 << 14;
        const ATOMIC_SWAP64 = 1 << 15;
        const ATOMIC_CSWAP32 = 1 << 16;
        const ATOMIC_CSWAP64 = 1 << 17;
        /// Atomics execute on the host CPU.
        const ATOMIC_CPU = 1 << 18;
        /// Atomics execute on the device.
        const ATOMIC_DEVICE = 1 << 19;
        /// The interface can expose a wakeup handle.
        const WAKEUP = 1 << 20;
        const CONNECT_TO_IFACE = 1 << 21;
        const CONNECT_TO_EP = 1 << 22;
    }
}

bitflags::bitflags! {
    /// Event classes a wakeup handle can be armed for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WakeupEvents: u32 {
        const TX_COMPLETION = 1 << 0;
        const RX_AM = 1 << 1;
        const RX_SIGNALED_AM = 1 << 2;
    }
}

/// Size ceilings per operation class.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IfaceLimits {
    pub max_am_short: usize,
    pub max_am_bcopy: usize,
    pub max_am_zcopy: usize,
    pub max_iov: usize,
    /// Below this, zero-copy is not worth the registration cost.
    pub min_zcopy: usize,
    pub max_am_hdr: usize,
}

/// Performance estimate used by resource selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IfacePerf {
    /// Bytes per second.
    pub bandwidth: f64,
    /// Per-operation overhead, seconds.
    pub overhead: f64,
    /// Tie-breaker between otherwise equal interfaces, higher wins.
    pub priority: u8,
}

/// Capability record of an opened interface.
#[derive(Debug, Clone, PartialEq)]
pub struct IfaceCaps {
    pub flags: IfaceFlags,
    pub limits: IfaceLimits,
    pub perf: IfacePerf,
}

/// One entry of the capability registry: a resource and its cached record.
#[derive(Debug, Clone)]
pub struct Resource {
    pub desc: ResourceDesc,
    pub caps: IfaceCaps,
}

/// A remote key: the unpacked fields of the opaque blob transports exchange
/// for one-sided access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RKey {
    pub md_index: u8,
    pub base: u64,
    pub handle: u64,
}

/// Parameters handed to [`Component::open`].
pub struct IfaceParams<'a> {
    /// Unique id of the opening worker, the key other in-process workers
    /// reach it under.
    pub worker_uuid: u64,
    /// Device to open, one of the component's enumerated `dev_name`s.
    pub dev_name: &'a str,
    /// Private bytes reserved ahead of every receive payload.
    pub rx_headroom: usize,
    /// Affinity for transport helper threads; empty leaves placement alone.
    pub cpu_mask: &'a CpuSet,
    /// Dispatch table, for tracer forwarding.
    pub am_table: AmTable,
    /// Where a driver with its own threads reports events posted outside
    /// the progress loop; the worker's next progress pass then re-drains.
    /// Purely synchronous drivers never touch it.
    pub async_notifier: AsyncNotifier,
}

/// One transport driver.
pub trait Component: Send + Sync {
    fn name(&self) -> &'static str;

    /// Enumerate (transport, device) resources with their capability
    /// records. Called once at context creation; the records are cached in
    /// the capability registry.
    fn resources(&self) -> Vec<Resource>;

    /// Open an interface on one of the enumerated devices.
    fn open(&self, params: &IfaceParams<'_>) -> Result<Box<dyn Iface>>;
}

/// An opened transport interface, owned exclusively by one worker.
pub trait Iface: Send {
    fn caps(&self) -> &IfaceCaps;

    /// Install the handler for `id`. At most one handler per id is live at
    /// any time; installing again replaces the previous one.
    fn set_am_handler(&mut self, id: AmId, cb: AmCallback, kind: AmKind) -> Result<()>;

    /// Install (or clear) the tracer table forwarded before dispatch.
    fn set_am_tracer(&mut self, table: Option<AmTable>);

    /// Open the wakeup handle. Only valid on interfaces advertising
    /// [`IfaceFlags::WAKEUP`].
    fn open_wakeup(&mut self) -> Result<Box<dyn WakeupHandle>>;

    /// Drain pending events, dispatching AM handlers and TX completions.
    /// Returns the number of events processed.
    fn progress(&mut self) -> u32;

    /// The interface address other workers connect to, as an opaque blob.
    fn address(&self) -> Vec<u8>;

    /// Connect an endpoint to a remote interface address.
    fn connect(&mut self, remote: &[u8]) -> Result<Box<dyn TlEp>>;

    /// Complete all outstanding operations.
    fn flush(&mut self) -> Result<()>;

    fn pack_rkey(&self, rkey: &RKey) -> Vec<u8>;

    fn unpack_rkey(&self, bytes: &[u8]) -> Result<RKey>;
}

/// A transport endpoint connected to one remote interface.
pub trait TlEp: Send {
    /// Send a small frame inline.
    fn am_short(&mut self, id: AmId, payload: &[u8]) -> Result<()>;

    /// Send a frame through an intermediate copy.
    fn am_bcopy(&mut self, id: AmId, payload: &[u8]) -> Result<()>;

    /// Complete all outstanding operations on this endpoint.
    fn flush(&mut self) -> Result<()>;
}

/// Per-interface wakeup handle.
pub trait WakeupHandle: Send {
    /// The descriptor added to the worker's aggregating event set.
    fn event_fd(&self) -> libc::c_int;

    /// Arm for the given event classes.
    ///
    /// Fails with [`crate::Status::Busy`] when events are already pending;
    /// the caller must skip the blocking step and progress instead.
    fn arm(&self, events: WakeupEvents) -> Result<()>;
}

/// The underlying transport worker.
///
/// Carries the progress callbacks transports and protocols register to run
/// on the main thread from within worker progress. Callbacks are plain
/// function pointers over the host state `A` so the registry can live
/// inside the state it feeds back into.
pub struct TlWorker<A> {
    progress_cbs: Vec<fn(&mut A)>,
}

impl<A> TlWorker<A> {
    pub fn new() -> Self {
        TlWorker {
            progress_cbs: Vec::new(),
        }
    }

    pub fn register_progress(&mut self, cb: fn(&mut A)) {
        self.progress_cbs.push(cb);
    }

    pub fn progress_cb_count(&self) -> usize {
        self.progress_cbs.len()
    }

    pub fn progress_cb(&self, index: usize) -> fn(&mut A) {
        self.progress_cbs[index]
    }
}

impl<A> Default for TlWorker<A> {
    fn default() -> Self {
        TlWorker::new()
    }
}
