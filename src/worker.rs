//! The worker: one progress domain owning an interface per transport
//! resource, the active-message dispatch on top of them, the wakeup
//! machinery, and the endpoint tables.
//!
//! Construction follows a strict order so that teardown can run in exact
//! reverse; see [`Worker::create`] and the `Drop` impl. All mutable state
//! lives behind the conditional lock chosen by the thread mode, except for
//! the pieces other threads must reach lock-free (`signal`, statistics).

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use crate::am::{self, AmKind, AmTable, Features};
use crate::async_ctx::{AsyncContext, AsyncNotifier};
use crate::config::{ThreadMode, WorkerParams};
use crate::context::Context;
use crate::pool::RequestPool;
use crate::stats::WorkerStats;
use crate::status::{Result, Status};
use crate::sys;
use crate::tl::{
    Iface, IfaceCaps, IfaceFlags, IfaceParams, ResourceDesc, RscIndex, TlWorker, WakeupHandle,
};

mod epconf;
mod eps;
mod lock;
mod wakeup;

pub use epconf::EpConfigKey;

use epconf::EpConfigTable;
use eps::Endpoint;
use lock::{CondLock, LockKind};

/// Handle to an endpoint owned by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpHandle(pub(crate) u32);

/// Index of a deduplicated endpoint configuration.
///
/// Endpoints embed this instead of the full key; the table is bounded so
/// the index always fits the 8 bits reserved for it.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpConfigIndex(pub u8);

/// One opened interface and its cached records, dense over `num_tls`.
pub(crate) struct IfaceSlot {
    pub rsc: RscIndex,
    pub desc: ResourceDesc,
    pub caps: IfaceCaps,
    pub iface: Box<dyn Iface>,
}

/// Wakeup state: the self-pipe, the lazily built aggregating event
/// descriptor, and one optional wakeup handle per interface.
pub(crate) struct WakeupCore {
    pub pipe: sys::Pipe,
    pub epfd: Option<sys::EpollFd>,
    pub handles: Vec<Option<Box<dyn WakeupHandle>>>,
}

/// Everything guarded by the worker lock.
pub(crate) struct WorkerCore {
    pub ifaces: Vec<IfaceSlot>,
    pub wakeup: WakeupCore,
    pub eps: Vec<Option<Endpoint>>,
    pub reply_eps: BTreeMap<u64, EpHandle>,
    pub stub_eps: Vec<EpHandle>,
    pub ep_configs: EpConfigTable,
    pub pool: RequestPool,
    pub tl_worker: TlWorker<WorkerCore>,
    pub atomic_tls: u64,
    pub features: Features,
    pub am_table: AmTable,
}

/// Effective threading report of [`Worker::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerAttr {
    pub thread_mode: ThreadMode,
}

/// A progress domain over the context's transport resources.
pub struct Worker {
    context: Arc<Context>,
    uuid: u64,
    name: String,
    mode: ThreadMode,
    num_tls: usize,
    /// 0 outside `progress`, 1 inside.
    inprogress: AtomicU32,
    /// The self-pipe write end; written lock-free by `signal`.
    signal_fd: libc::c_int,
    stats: WorkerStats,
    async_ctx: AsyncContext,
    core: CondLock<WorkerCore>,
}

impl Worker {
    pub(crate) fn create(context: Arc<Context>, params: &WorkerParams) -> Result<Worker> {
        let config = context.config();
        let num_tls = context.resources().len();
        if num_tls > 64 {
            // Selection masks are 64 bits wide.
            return Err(Status::Unsupported);
        }

        // Construction runs in a fixed order so a failure at any point can
        // unwind in exact reverse; destroy mirrors the same sequence. The
        // bounded configuration table and lock choice come first, then
        // identity, the per-interface arrays, wakeup state, the async
        // progress context, the transport worker, the request pool, and
        // finally the interfaces themselves.
        let ep_configs = EpConfigTable::new(epconf::table_bound(num_tls));
        let mode = params.thread_mode;
        let kind = match (mode, config.use_mt_mutex) {
            (ThreadMode::Single, _) => LockKind::None,
            (ThreadMode::Multi, false) => LockKind::Spin,
            (ThreadMode::Multi, true) => LockKind::Mutex,
        };
        let uuid = next_uuid(Arc::as_ptr(&context) as u64);
        let name = format!("{}:{}", sys::host_name(), std::process::id());
        let reply_eps = BTreeMap::new();
        let am_table = context.am_table();
        let features = config.features;
        let stats = WorkerStats::default();
        let wakeup = WakeupCore {
            pipe: sys::Pipe::new()?,
            epfd: None,
            handles: Vec::with_capacity(num_tls),
        };
        let async_ctx = AsyncContext::new(&name);
        let notifier = async_ctx.notifier();
        let mut tl_worker = TlWorker::new();
        tl_worker.register_progress(eps::progress_stub_eps);
        let pool = RequestPool::new(config.request_trailer)?;

        let mut core = WorkerCore {
            ifaces: Vec::with_capacity(num_tls),
            wakeup,
            eps: Vec::new(),
            reply_eps,
            stub_eps: Vec::new(),
            ep_configs,
            pool,
            tl_worker,
            atomic_tls: 0,
            features,
            am_table,
        };

        if let Err(err) = open_ifaces(&mut core, &context, params, &notifier, uuid, &name) {
            // Unwind the partially opened set the way destroy does: each
            // wakeup handle ahead of its interface, newest first. The
            // remaining pieces unwind as the locals drop.
            close_ifaces(&mut core);
            return Err(err);
        }

        let view: Vec<(&ResourceDesc, &IfaceCaps)> = core
            .ifaces
            .iter()
            .map(|slot| (&slot.desc, &slot.caps))
            .collect();
        core.atomic_tls = crate::atomic::select(config.atomic_mode, features, &view);
        drop(view);

        let signal_fd = core.wakeup.pipe.write_fd();
        log::debug!("created worker {name} uuid {uuid:#018x} over {num_tls} resources");

        Ok(Worker {
            context,
            uuid,
            name,
            mode,
            num_tls,
            inprogress: AtomicU32::new(0),
            signal_fd,
            stats,
            async_ctx,
            core: CondLock::new(kind, core),
        })
    }

    /// Drain transport events: dispatch sync AM handlers and completion
    /// callbacks, then run registered progress callbacks and the missed
    /// async-event check. Returns the number of events processed.
    ///
    /// Non-reentrant; must not be called from an AM handler.
    pub fn progress(&self) -> u32 {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let prev = self.inprogress.fetch_add(1, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "worker progress is non-reentrant");
        WorkerStats::bump(&self.stats.progress_calls);

        let mut count = drain_ifaces(core);
        for index in 0..core.tl_worker.progress_cb_count() {
            let cb = core.tl_worker.progress_cb(index);
            cb(core);
        }
        if self.async_ctx.take_missed() {
            count += drain_ifaces(core);
        }

        WorkerStats::add(&self.stats.events, u64::from(count));
        self.inprogress.fetch_sub(1, Ordering::AcqRel);
        count
    }

    /// Effective threading attributes.
    pub fn query(&self) -> WorkerAttr {
        WorkerAttr {
            thread_mode: self.mode,
        }
    }

    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bitmask over resource indices carrying one-sided atomics.
    pub fn atomic_tls(&self) -> u64 {
        self.core.lock().atomic_tls
    }

    /// Publishable address of this worker: uuid, name and one opaque blob
    /// per interface. Releasing the address is dropping it.
    pub fn address(&self) -> WorkerAddress {
        let core = self.core.lock();
        WorkerAddress {
            uuid: self.uuid,
            name: self.name.clone(),
            parts: core
                .ifaces
                .iter()
                .map(|slot| (slot.rsc, slot.iface.address()))
                .collect(),
        }
    }

    /// Write a human-readable summary of the worker to `out`.
    pub fn print_info(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let core = self.core.lock();
        writeln!(
            out,
            "worker '{}' uuid {:#018x} mode {:?}",
            self.name, self.uuid, self.mode
        )?;
        for slot in &core.ifaces {
            let atomic = if core.atomic_tls & slot.rsc.bit() != 0 {
                " atomic"
            } else {
                ""
            };
            writeln!(
                out,
                "  rsc {}: {}/{} md {} bw {:.0} MB/s prio {}{}",
                slot.rsc.0,
                slot.desc.tl_name,
                slot.desc.dev_name,
                slot.desc.md_index,
                slot.caps.perf.bandwidth / 1e6,
                slot.caps.perf.priority,
                atomic,
            )?;
        }
        writeln!(
            out,
            "  atomic tls {:#x}, {} ep configs, {} eps, {} progress calls, {} events",
            core.atomic_tls,
            core.ep_configs.len(),
            core.reply_eps.len(),
            WorkerStats::get(&self.stats.progress_calls),
            WorkerStats::get(&self.stats.events),
        )?;
        Ok(())
    }

    /// The context this worker was created from.
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        {
            let mut guard = self.core.lock();
            let core = &mut *guard;

            // Break the incoming callback edges: every active id reverts to
            // the drop handler before any interface goes away.
            for slot in &mut core.ifaces {
                let sync_ok = slot.caps.flags.contains(IfaceFlags::AM_CB_SYNC);
                for def in core.am_table.active(core.features) {
                    if def.kind == AmKind::Sync && !sync_ok {
                        continue;
                    }
                    let _ = slot.iface.set_am_handler(def.id, am::drop_handler, def.kind);
                }
                slot.iface.set_am_tracer(None);
            }

            // Endpoints go while their interfaces are still alive.
            core.reply_eps.clear();
            core.stub_eps.clear();
            for ep in core.eps.drain(..).flatten() {
                ep.teardown();
            }

            // Interfaces close in reverse creation order, each preceded by
            // its wakeup handle.
            close_ifaces(core);
            core.wakeup.epfd = None;
        }
        // Pool, transport worker and pipe drop with the core; the async
        // thread is stopped first so nothing races the teardown.
        self.async_ctx.stop();
        log::debug!(
            "destroyed worker {}: {} progress calls, {} events, {} sends, {} signals",
            self.name,
            WorkerStats::get(&self.stats.progress_calls),
            WorkerStats::get(&self.stats.events),
            WorkerStats::get(&self.stats.am_sends),
            WorkerStats::get(&self.stats.signals),
        );
    }
}

fn drain_ifaces(core: &mut WorkerCore) -> u32 {
    core.ifaces
        .iter_mut()
        .map(|slot| slot.iface.progress())
        .sum()
}

/// Open one interface per enumerated resource, installing handlers, the
/// tracer and the wakeup handle as each comes up. An error leaves the
/// already-opened prefix in `core` for the caller to unwind.
fn open_ifaces(
    core: &mut WorkerCore,
    context: &Context,
    params: &WorkerParams,
    notifier: &AsyncNotifier,
    uuid: u64,
    name: &str,
) -> Result<()> {
    let config = context.config();
    for (index, entry) in context.resources().iter().enumerate() {
        let rsc = RscIndex(index as u8);
        let mut iface = entry.component.open(&IfaceParams {
            worker_uuid: uuid,
            dev_name: &entry.resource.desc.dev_name,
            rx_headroom: config.rx_headroom,
            cpu_mask: &params.cpu_mask,
            am_table: core.am_table,
            async_notifier: notifier.clone(),
        })?;
        install_am_handlers(&mut *iface, core.am_table, core.features)?;
        iface.set_am_tracer(Some(core.am_table));

        let caps = iface.caps().clone();
        let handle = if caps.flags.contains(IfaceFlags::WAKEUP) {
            Some(iface.open_wakeup()?)
        } else {
            None
        };
        core.wakeup.handles.push(handle);
        log::debug!(
            "worker {name}: rsc {} is {}/{}",
            rsc.0,
            entry.resource.desc.tl_name,
            entry.resource.desc.dev_name,
        );
        core.ifaces.push(IfaceSlot {
            rsc,
            desc: entry.resource.desc.clone(),
            caps,
            iface,
        });
    }
    Ok(())
}

/// Close every opened interface in reverse creation order, its wakeup
/// handle first. Shared by destroy and the create-failure unwind.
fn close_ifaces(core: &mut WorkerCore) {
    while let Some(handle) = core.wakeup.handles.pop() {
        drop(handle);
        drop(core.ifaces.pop());
    }
}

/// Install every AM id whose feature mask intersects the context features
/// and whose kind the interface supports.
fn install_am_handlers(
    iface: &mut dyn Iface,
    table: AmTable,
    features: Features,
) -> Result<()> {
    let sync_ok = iface.caps().flags.contains(IfaceFlags::AM_CB_SYNC);
    for def in table.active(features) {
        if def.kind == AmKind::Sync && !sync_ok {
            // The transport selector keeps these protocols off this
            // interface; nothing to install.
            log::debug!("am id {}: sync handler on async-only interface, skipped", def.id.0);
            continue;
        }
        iface.set_am_handler(def.id, def.cb, def.kind)?;
    }
    Ok(())
}

fn next_uuid(seed: u64) -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = u64::from(std::process::id());
    (seed ^ (seq << 32) ^ (pid << 8)).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// A worker's published address.
///
/// Packs to a flat byte blob for the wire; parsing recovers the uuid, name
/// and the per-interface opaque address parts. Transport parts are never
/// interpreted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAddress {
    uuid: u64,
    name: String,
    parts: Vec<(RscIndex, Vec<u8>)>,
}

impl WorkerAddress {
    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parts(&self) -> &[(RscIndex, Vec<u8>)] {
        &self.parts
    }

    /// Serialize for publication.
    pub fn pack(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let name_len = name.len().min(u8::MAX as usize);
        let mut bytes = Vec::with_capacity(10 + name_len + self.parts.len() * 3);
        bytes.extend_from_slice(&self.uuid.to_le_bytes());
        bytes.push(name_len as u8);
        bytes.extend_from_slice(&name[..name_len]);
        bytes.push(self.parts.len() as u8);
        for (rsc, part) in &self.parts {
            bytes.push(rsc.0);
            bytes.extend_from_slice(&(part.len() as u16).to_le_bytes());
            bytes.extend_from_slice(part);
        }
        bytes
    }

    /// Parse a packed address.
    pub fn parse(bytes: &[u8]) -> Result<WorkerAddress> {
        let mut cursor = Cursor { bytes, at: 0 };
        let uuid = u64::from_le_bytes(cursor.fixed()?);
        let name_len = usize::from(cursor.byte()?);
        let name = core::str::from_utf8(cursor.take(name_len)?)
            .map_err(|_| Status::InvalidParam)?
            .to_owned();
        let count = usize::from(cursor.byte()?);
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            let rsc = RscIndex(cursor.byte()?);
            let len = usize::from(u16::from_le_bytes(cursor.fixed()?));
            parts.push((rsc, cursor.take(len)?.to_vec()));
        }
        if cursor.at != bytes.len() {
            return Err(Status::InvalidParam);
        }
        Ok(WorkerAddress { uuid, name, parts })
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.at.checked_add(n).ok_or(Status::InvalidParam)?;
        let slice = self.bytes.get(self.at..end).ok_or(Status::InvalidParam)?;
        self.at = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.take(N)?.try_into().map_err(|_| Status::InvalidParam)
    }
}
