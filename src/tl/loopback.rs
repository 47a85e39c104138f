//! The loopback transport: in-process worker↔worker traffic.
//!
//! Every opened interface registers a *port* in a process-global set keyed
//! by worker uuid; endpoints resolve their peer through that set and push
//! frames straight into its receive queue. Wakeup is an eventfd posted when
//! a frame arrives on an armed port.

use core::sync::atomic::AtomicUsize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::am::{self, AmCallback, AmFrame, AmId, AmKind, AmTable, RxCredit, AM_ID_LAST};
use crate::status::{Result, Status};
use crate::sys::EventFd;
use crate::tl::{
    Component, Iface, IfaceCaps, IfaceFlags, IfaceLimits, IfaceParams, IfacePerf, RKey, Resource,
    ResourceDesc, TlEp, WakeupEvents, WakeupHandle,
};

/// Transport name, as matched by the `FABRIQ_TLS` filter.
pub const TL_NAME: &str = "loopback";

const DEV_NAME: &str = "memory";
const MAX_AM_SHORT: usize = 256;
const MAX_AM_BCOPY: usize = 64 * 1024;

/// The loopback transport component.
pub struct Loopback;

fn iface_caps() -> IfaceCaps {
    IfaceCaps {
        flags: IfaceFlags::AM_SHORT
            | IfaceFlags::AM_BCOPY
            | IfaceFlags::AM_CB_SYNC
            | IfaceFlags::PUT_SHORT
            | IfaceFlags::PUT_BCOPY
            | IfaceFlags::GET_BCOPY
            | IfaceFlags::ATOMIC_ADD32
            | IfaceFlags::ATOMIC_ADD64
            | IfaceFlags::ATOMIC_FADD32
            | IfaceFlags::ATOMIC_FADD64
            | IfaceFlags::ATOMIC_SWAP32
            | IfaceFlags::ATOMIC_SWAP64
            | IfaceFlags::ATOMIC_CSWAP32
            | IfaceFlags::ATOMIC_CSWAP64
            | IfaceFlags::ATOMIC_CPU
            | IfaceFlags::WAKEUP
            | IfaceFlags::CONNECT_TO_IFACE,
        limits: IfaceLimits {
            max_am_short: MAX_AM_SHORT,
            max_am_bcopy: MAX_AM_BCOPY,
            max_am_zcopy: 0,
            max_iov: 1,
            min_zcopy: 0,
            max_am_hdr: 64,
        },
        perf: IfacePerf {
            bandwidth: 12e9,
            overhead: 10e-9,
            priority: 0,
        },
    }
}

/// Process-global port set. Insertion fails on uuid collision; a port
/// leaves the set when its interface closes.
static PORTS: spin::RwLock<BTreeMap<u64, Arc<Port>>> = spin::RwLock::new(BTreeMap::new());

struct Port {
    uuid: u64,
    rx_headroom: usize,
    rx: spin::Mutex<RxQueue>,
    handlers: spin::RwLock<HandlerSet>,
    efd: EventFd,
    outstanding: Arc<AtomicUsize>,
}

struct RxQueue {
    frames: VecDeque<RxFrame>,
    /// Event classes the wakeup handle is currently armed for. Guarded by
    /// the queue lock so arming serializes against concurrent senders.
    armed: WakeupEvents,
}

/// Headroom-prefixed receive slot.
struct RxFrame {
    id: AmId,
    bytes: Box<[u8]>,
}

struct HandlerSet {
    slots: [Option<(AmCallback, AmKind)>; AM_ID_LAST],
    tracer: Option<AmTable>,
}

impl Component for Loopback {
    fn name(&self) -> &'static str {
        TL_NAME
    }

    fn resources(&self) -> Vec<Resource> {
        vec![Resource {
            desc: ResourceDesc {
                tl_name: TL_NAME.into(),
                dev_name: DEV_NAME.into(),
                md_index: 0,
                md_supports_reg: true,
            },
            caps: iface_caps(),
        }]
    }

    fn open(&self, params: &IfaceParams<'_>) -> Result<Box<dyn Iface>> {
        if params.dev_name != DEV_NAME {
            return Err(Status::NoDevice);
        }
        let port = Arc::new(Port {
            uuid: params.worker_uuid,
            rx_headroom: params.rx_headroom,
            rx: spin::Mutex::new(RxQueue {
                frames: VecDeque::new(),
                armed: WakeupEvents::empty(),
            }),
            handlers: spin::RwLock::new(HandlerSet {
                slots: [None; AM_ID_LAST],
                tracer: Some(params.am_table),
            }),
            efd: EventFd::new()?,
            outstanding: Arc::new(AtomicUsize::new(0)),
        });

        let mut ports = PORTS.write();
        if ports.contains_key(&port.uuid) {
            return Err(Status::InvalidParam);
        }
        ports.insert(port.uuid, port.clone());
        drop(ports);

        Ok(Box::new(LoopbackIface {
            caps: iface_caps(),
            port,
        }))
    }
}

/// Receive descriptors currently held out of `worker_uuid`'s rx pool.
///
/// Test hook for the descriptor-ownership contract; `None` when no port is
/// registered under the uuid.
pub fn outstanding_descs(worker_uuid: u64) -> Option<usize> {
    let ports = PORTS.read();
    ports
        .get(&worker_uuid)
        .map(|port| port.outstanding.load(core::sync::atomic::Ordering::Relaxed))
}

struct LoopbackIface {
    caps: IfaceCaps,
    port: Arc<Port>,
}

impl Drop for LoopbackIface {
    fn drop(&mut self) {
        PORTS.write().remove(&self.port.uuid);
    }
}

impl Iface for LoopbackIface {
    fn caps(&self) -> &IfaceCaps {
        &self.caps
    }

    fn set_am_handler(&mut self, id: AmId, cb: AmCallback, kind: AmKind) -> Result<()> {
        let slot = usize::from(id.0);
        if slot >= AM_ID_LAST {
            return Err(Status::InvalidParam);
        }
        self.port.handlers.write().slots[slot] = Some((cb, kind));
        Ok(())
    }

    fn set_am_tracer(&mut self, table: Option<AmTable>) {
        self.port.handlers.write().tracer = table;
    }

    fn open_wakeup(&mut self) -> Result<Box<dyn WakeupHandle>> {
        Ok(Box::new(LoopbackWakeup {
            port: self.port.clone(),
        }))
    }

    fn progress(&mut self) -> u32 {
        let mut count = 0;
        loop {
            // Pop under the lock, dispatch outside of it.
            let frame = self.port.rx.lock().frames.pop_front();
            let Some(frame) = frame else { break };
            self.dispatch(frame);
            count += 1;
        }
        count
    }

    fn address(&self) -> Vec<u8> {
        self.port.uuid.to_le_bytes().to_vec()
    }

    fn connect(&mut self, remote: &[u8]) -> Result<Box<dyn TlEp>> {
        let bytes: [u8; 8] = remote.try_into().map_err(|_| Status::InvalidParam)?;
        let uuid = u64::from_le_bytes(bytes);
        let peer = PORTS.read().get(&uuid).cloned().ok_or(Status::NoDevice)?;
        Ok(Box::new(LoopbackEp { peer }))
    }

    fn flush(&mut self) -> Result<()> {
        // Sends complete inline, there is never anything in flight.
        Ok(())
    }

    fn pack_rkey(&self, rkey: &RKey) -> Vec<u8> {
        let mut packed = Vec::with_capacity(17);
        packed.push(rkey.md_index);
        packed.extend_from_slice(&rkey.base.to_le_bytes());
        packed.extend_from_slice(&rkey.handle.to_le_bytes());
        packed
    }

    fn unpack_rkey(&self, bytes: &[u8]) -> Result<RKey> {
        if bytes.len() != 17 {
            return Err(Status::InvalidParam);
        }
        let base: [u8; 8] = bytes[1..9].try_into().map_err(|_| Status::InvalidParam)?;
        let handle: [u8; 8] = bytes[9..17].try_into().map_err(|_| Status::InvalidParam)?;
        Ok(RKey {
            md_index: bytes[0],
            base: u64::from_le_bytes(base),
            handle: u64::from_le_bytes(handle),
        })
    }
}

impl LoopbackIface {
    fn dispatch(&self, frame: RxFrame) {
        let (slot, tracer) = {
            let handlers = self.port.handlers.read();
            (handlers.slots[usize::from(frame.id.0)], handlers.tracer)
        };
        if let Some(table) = tracer {
            am::forward_trace(table, frame.id, &frame.bytes[self.port.rx_headroom..]);
        }
        match slot {
            Some((cb, _kind)) => {
                let credit = RxCredit::take(self.port.outstanding.clone());
                let am_frame =
                    AmFrame::new(frame.id, frame.bytes, self.port.rx_headroom, Some(credit));
                cb(am_frame);
            }
            None => {
                log::warn!(
                    "loopback: dropping am frame id {} with no handler installed",
                    frame.id.0
                );
            }
        }
    }
}

struct LoopbackEp {
    peer: Arc<Port>,
}

impl LoopbackEp {
    fn push(&self, id: AmId, payload: &[u8]) {
        let mut bytes = vec![0u8; self.peer.rx_headroom + payload.len()].into_boxed_slice();
        bytes[self.peer.rx_headroom..].copy_from_slice(payload);
        let mut queue = self.peer.rx.lock();
        queue.frames.push_back(RxFrame { id, bytes });
        if queue
            .armed
            .intersects(WakeupEvents::RX_AM | WakeupEvents::RX_SIGNALED_AM)
        {
            self.peer.efd.post();
        }
    }
}

impl TlEp for LoopbackEp {
    fn am_short(&mut self, id: AmId, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_AM_SHORT {
            return Err(Status::InvalidParam);
        }
        self.push(id, payload);
        Ok(())
    }

    fn am_bcopy(&mut self, id: AmId, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_AM_BCOPY {
            return Err(Status::InvalidParam);
        }
        self.push(id, payload);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

struct LoopbackWakeup {
    port: Arc<Port>,
}

impl WakeupHandle for LoopbackWakeup {
    fn event_fd(&self) -> libc::c_int {
        self.port.efd.fd()
    }

    fn arm(&self, events: WakeupEvents) -> Result<()> {
        let mut queue = self.port.rx.lock();
        if !queue.frames.is_empty()
            && events.intersects(WakeupEvents::RX_AM | WakeupEvents::RX_SIGNALED_AM)
        {
            return Err(Status::Busy);
        }
        self.port.efd.clear();
        queue.armed = events;
        Ok(())
    }
}
