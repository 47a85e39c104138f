//! Reply endpoints: the per-peer map, stub endpoints queueing operations
//! until wire-up completes, and the main-thread promotion pass.

use core::mem;
use std::collections::VecDeque;

use crate::am::AmId;
use crate::pool::{RequestHandle, RequestHeader};
use crate::stats::WorkerStats;
use crate::status::{Result, Status};
use crate::tl::{IfaceFlags, RscIndex, TlEp};
use crate::worker::{EpConfigIndex, EpConfigKey, EpHandle, IfaceSlot, Worker, WorkerCore};

pub(crate) struct Endpoint {
    pub peer: u64,
    pub state: EpState,
}

pub(crate) enum EpState {
    /// Placeholder until the wire-up protocol promotes the endpoint;
    /// outgoing operations queue here meanwhile.
    Stub { pending: VecDeque<PendingOp> },
    Connected {
        rsc: RscIndex,
        config: EpConfigIndex,
        ep: Box<dyn TlEp>,
    },
}

pub(crate) struct PendingOp {
    pub id: AmId,
    pub payload: Vec<u8>,
}

impl Endpoint {
    fn stub(peer: u64) -> Self {
        Endpoint {
            peer,
            state: EpState::Stub {
                pending: VecDeque::new(),
            },
        }
    }

    pub fn teardown(self) {
        if let EpState::Connected { mut ep, .. } = self.state {
            let _ = ep.flush();
        }
    }
}

impl Worker {
    /// The endpoint replies to `peer` travel through.
    ///
    /// At most one endpoint exists per peer uuid. A miss creates a stub
    /// endpoint; promotion happens on the main thread during `progress`,
    /// never from an async callback.
    pub fn get_reply_ep(&self, peer: u64) -> Result<EpHandle> {
        let _block = self.async_ctx.block();
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if let Some(&handle) = core.reply_eps.get(&peer) {
            return Ok(handle);
        }
        let handle = core.alloc_ep(Endpoint::stub(peer));
        core.reply_eps.insert(peer, handle);
        core.stub_eps.push(handle);
        WorkerStats::bump(&self.stats.eps_created);
        log::debug!(
            "worker {}: stub endpoint {} for peer {peer:#018x}",
            self.name,
            handle.0,
        );
        Ok(handle)
    }

    /// Send an active message on `handle`.
    ///
    /// Stub endpoints queue the operation. Transport back-pressure
    /// (`NoResource`) is pumped through progress and retried, it never
    /// reaches the caller.
    pub fn am_send(&self, handle: EpHandle, id: AmId, payload: &[u8]) -> Result<()> {
        let mut guard = self.core.lock();
        WorkerStats::bump(&self.stats.am_sends);
        guard.am_send(handle, id, payload)
    }

    /// Destroy an endpoint, removing it from the reply map.
    pub fn destroy_ep(&self, handle: EpHandle) -> Result<()> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let ep = core
            .eps
            .get_mut(handle.0 as usize)
            .and_then(Option::take)
            .ok_or(Status::InvalidParam)?;
        core.reply_eps.remove(&ep.peer);
        core.stub_eps.retain(|stub| *stub != handle);
        ep.teardown();
        Ok(())
    }

    /// Whether `handle` still queues operations awaiting promotion.
    pub fn ep_is_stub(&self, handle: EpHandle) -> Result<bool> {
        let guard = self.core.lock();
        match guard.eps.get(handle.0 as usize) {
            Some(Some(ep)) => Ok(matches!(ep.state, EpState::Stub { .. })),
            _ => Err(Status::InvalidParam),
        }
    }

    /// Allocate a reply request bound to `peer`'s reply endpoint.
    ///
    /// The pool is unbounded; an allocation failure is a process-level
    /// invariant violation and aborts rather than returning an error.
    pub fn allocate_reply(&self, peer: u64) -> Result<RequestHandle> {
        let handle = self.get_reply_ep(peer)?;
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let ptr = core.pool.get();
        // Safety: the element is at least RequestHeader-sized and owned by
        // the returned handle until released.
        unsafe {
            ptr.cast::<RequestHeader>().as_ptr().write(RequestHeader {
                peer,
                ep: handle.0,
                flags: 0,
            });
        }
        Ok(RequestHandle {
            ptr,
            trailer: core.pool.trailer(),
        })
    }

    /// Return a request obtained from [`Worker::allocate_reply`].
    pub fn release_request(&self, request: RequestHandle) {
        self.core.lock().pool.put(request.ptr);
    }

    /// Deduplicated configuration index for `key`; equal keys map to equal
    /// indices for the life of the worker.
    pub fn get_ep_config(&self, key: &EpConfigKey) -> EpConfigIndex {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let WorkerCore {
            ep_configs, ifaces, ..
        } = core;
        ep_configs.get_or_insert(key, ifaces)
    }
}

impl WorkerCore {
    fn alloc_ep(&mut self, ep: Endpoint) -> EpHandle {
        if let Some(index) = self.eps.iter().position(Option::is_none) {
            self.eps[index] = Some(ep);
            return EpHandle(index as u32);
        }
        self.eps.push(Some(ep));
        EpHandle((self.eps.len() - 1) as u32)
    }

    pub(crate) fn am_send(&mut self, handle: EpHandle, id: AmId, payload: &[u8]) -> Result<()> {
        let max_bcopy = self
            .ifaces
            .iter()
            .map(|slot| slot.caps.limits.max_am_bcopy)
            .max()
            .unwrap_or(0);
        let WorkerCore {
            eps,
            ifaces,
            ep_configs,
            ..
        } = self;
        let Some(Some(ep)) = eps.get_mut(handle.0 as usize) else {
            return Err(Status::InvalidParam);
        };
        match &mut ep.state {
            EpState::Stub { pending } => {
                // Coarse cap at queue time; promotion later picks an
                // interface that fits everything queued here.
                if payload.len() > max_bcopy {
                    return Err(Status::InvalidParam);
                }
                pending.push_back(PendingOp {
                    id,
                    payload: payload.to_vec(),
                });
                Ok(())
            }
            EpState::Connected { rsc, config, ep } => {
                let short_limit = ep_configs
                    .get(*config)
                    .map(|entry| entry.max_short)
                    .unwrap_or(0);
                send_one(ifaces, *rsc, short_limit, ep, id, payload)
            }
        }
    }
}

/// One send on the chosen lane: inline below the configuration's short
/// threshold, copy-out otherwise. `NoResource` pumps interface progress
/// and retries.
fn send_one(
    ifaces: &mut [IfaceSlot],
    rsc: RscIndex,
    short_limit: usize,
    ep: &mut Box<dyn TlEp>,
    id: AmId,
    payload: &[u8],
) -> Result<()> {
    let limits = ifaces[usize::from(rsc.0)].caps.limits;
    if payload.len() > limits.max_am_bcopy {
        return Err(Status::InvalidParam);
    }
    loop {
        let attempt = if payload.len() <= short_limit {
            ep.am_short(id, payload)
        } else {
            ep.am_bcopy(id, payload)
        };
        match attempt {
            Err(Status::NoResource) => {
                for slot in ifaces.iter_mut() {
                    slot.iface.progress();
                }
            }
            other => return other,
        }
    }
}

/// Transport-level progress callback promoting stub endpoints.
///
/// Runs on the main thread from within worker progress, so promotion never
/// races an async callback and handler re-entrancy invariants hold.
pub(crate) fn progress_stub_eps(core: &mut WorkerCore) {
    if core.stub_eps.is_empty() {
        return;
    }
    let stubs = mem::take(&mut core.stub_eps);
    for handle in stubs {
        if !try_promote(core, handle) {
            core.stub_eps.push(handle);
        }
    }
}

/// Attempt one promotion. Returns whether `handle` is finished with the
/// stub list, either promoted or gone.
fn try_promote(core: &mut WorkerCore, handle: EpHandle) -> bool {
    let (peer, max_pending) = match core.eps.get(handle.0 as usize) {
        Some(Some(ep)) => match &ep.state {
            EpState::Stub { pending } => (
                ep.peer,
                pending.iter().map(|op| op.payload.len()).max().unwrap_or(0),
            ),
            EpState::Connected { .. } => return true,
        },
        _ => return true,
    };

    // First interface that can reach the peer and carry the largest queued
    // payload wins. An unreachable peer is not an error, wire-up simply
    // has not completed yet.
    let mut connected = None;
    for slot in core.ifaces.iter_mut() {
        if !slot.caps.flags.contains(IfaceFlags::AM_BCOPY)
            || slot.caps.limits.max_am_bcopy < max_pending
        {
            continue;
        }
        match slot.iface.connect(&peer.to_le_bytes()) {
            Ok(ep) => {
                connected = Some((slot.rsc, ep));
                break;
            }
            Err(Status::NoDevice) => continue,
            Err(err) => {
                log::warn!(
                    "stub promotion: connect on {}/{} failed: {err}",
                    slot.desc.tl_name,
                    slot.desc.dev_name,
                );
            }
        }
    }
    let Some((rsc, mut tl_ep)) = connected else {
        return false;
    };

    let key = EpConfigKey::for_am_lane(
        rsc,
        core.atomic_tls,
        &core.ifaces[usize::from(rsc.0)].caps.limits,
    );
    let config = {
        let WorkerCore {
            ep_configs, ifaces, ..
        } = core;
        ep_configs.get_or_insert(&key, ifaces)
    };
    let short_limit = core
        .ep_configs
        .get(config)
        .map(|entry| entry.max_short)
        .unwrap_or(0);

    // Flush the queue through the new endpoint before the state switches.
    // An op that fails stays at the head of the queue and the whole
    // promotion is retried on a later pass; nothing is dropped.
    let WorkerCore { eps, ifaces, .. } = core;
    let Some(Some(ep)) = eps.get_mut(handle.0 as usize) else {
        return true;
    };
    let EpState::Stub { pending } = &mut ep.state else {
        return true;
    };
    while let Some(op) = pending.pop_front() {
        if let Err(err) = send_one(ifaces, rsc, short_limit, &mut tl_ep, op.id, &op.payload) {
            log::warn!(
                "promotion of endpoint {} interrupted, op stays queued: {err}",
                handle.0,
            );
            pending.push_front(op);
            return false;
        }
    }
    ep.state = EpState::Connected {
        rsc,
        config,
        ep: tl_ep,
    };
    log::debug!(
        "promoted endpoint {} to peer {:#018x} on rsc {}",
        handle.0,
        peer,
        rsc.0,
    );
    true
}
