//! Active-message dispatch: the process-wide handler table, the feature
//! gates deciding which ids are live on a worker, and the ownership rules
//! for receive descriptors crossing the transport/handler boundary.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::status::{Result, Status};

/// Number of assignable active-message ids, `[0, AM_ID_LAST)`.
pub const AM_ID_LAST: usize = 16;

/// An active-message identifier.
///
/// The first protocol byte of an incoming frame; selects the receiver-side
/// handler. Dense over [`AM_ID_LAST`].
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AmId(pub u8);

bitflags::bitflags! {
    /// Context feature set gating which AM ids are installed on a worker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        /// Active messaging.
        const AM = 1 << 0;
        /// One-sided remote memory access.
        const RMA = 1 << 1;
        /// 32-bit atomic operations.
        const AMO32 = 1 << 2;
        /// 64-bit atomic operations.
        const AMO64 = 1 << 3;
        /// Blocking wakeup support.
        const WAKEUP = 1 << 4;
    }
}

/// Execution context of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmKind {
    /// Runs on the thread calling `progress`.
    Sync,
    /// May run on a transport-owned thread; must tolerate concurrency with
    /// application threads.
    Async,
}

/// Disposition returned by a handler.
///
/// The descriptor itself moves through [`AmFrame`]/[`HeldDesc`]; this value
/// only tells the transport how to account the receive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmAction {
    /// The handler consumed the payload during the call, the receive slot
    /// is reclaimed immediately.
    Done,
    /// The handler converted the frame into a [`HeldDesc`] and releases the
    /// slot later.
    Held,
}

/// Handler callback: receives the frame, returns its disposition.
pub type AmCallback = fn(AmFrame) -> AmAction;

/// Optional tracer, invoked with the id and payload of every frame before
/// dispatch.
pub type AmTracer = fn(AmId, &[u8]);

/// One slot of the dispatch table.
pub struct AmDef {
    pub id: AmId,
    /// The id is active on a worker iff this mask intersects the context
    /// feature set.
    pub features: Features,
    pub kind: AmKind,
    pub cb: AmCallback,
    pub tracer: Option<AmTracer>,
}

/// The immutable process-wide dispatch table.
///
/// Built once from a static slice when the context is created; a copy of
/// the wrapper is all that moves around afterwards.
#[derive(Clone, Copy)]
pub struct AmTable {
    defs: &'static [AmDef],
}

impl core::fmt::Debug for AmTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "AmTable({} defs)", self.defs.len())
    }
}

impl AmTable {
    /// Validate and wrap a handler table.
    ///
    /// Ids must be unique and below [`AM_ID_LAST`].
    pub fn new(defs: &'static [AmDef]) -> Result<Self> {
        let mut seen = [false; AM_ID_LAST];
        for def in defs {
            let slot = seen
                .get_mut(usize::from(def.id.0))
                .ok_or(Status::InvalidParam)?;
            if core::mem::replace(slot, true) {
                return Err(Status::InvalidParam);
            }
        }
        Ok(AmTable { defs })
    }

    pub fn get(&self, id: AmId) -> Option<&'static AmDef> {
        self.defs.iter().find(|def| def.id == id)
    }

    /// The ids live under `features`, in table order.
    pub fn active(&self, features: Features) -> impl Iterator<Item = &'static AmDef> {
        self.defs
            .iter()
            .filter(move |def| def.features.intersects(features))
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

/// Forward a frame to the per-id tracer, if the table carries one.
pub fn forward_trace(table: AmTable, id: AmId, data: &[u8]) {
    if let Some(def) = table.get(id) {
        if let Some(tracer) = def.tracer {
            tracer(id, data);
        }
    }
}

/// The teardown handler: consumes and discards every frame.
///
/// Swapped into every active slot before any interface closes so that late
/// frames never reach freed protocol state.
pub fn drop_handler(frame: AmFrame) -> AmAction {
    drop(frame);
    AmAction::Done
}

/// Accounting token for one receive slot of a transport's rx pool.
///
/// Taking a credit bumps the pool's outstanding counter; dropping it (with
/// the buffer it travels in) gives the slot back.
pub struct RxCredit {
    outstanding: Arc<AtomicUsize>,
}

impl RxCredit {
    pub fn take(outstanding: Arc<AtomicUsize>) -> Self {
        outstanding.fetch_add(1, Ordering::Relaxed);
        RxCredit { outstanding }
    }
}

impl Drop for RxCredit {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

/// An incoming active-message frame, borrowed receive buffer included.
///
/// The buffer starts with `headroom` bytes of protocol-private space, the
/// payload follows. A handler either lets the frame drop (the `Done` path,
/// the slot is reclaimed as the call returns) or moves the buffer out via
/// [`AmFrame::into_held`] and returns [`AmAction::Held`].
pub struct AmFrame {
    id: AmId,
    bytes: Box<[u8]>,
    headroom: usize,
    credit: Option<RxCredit>,
}

impl AmFrame {
    /// Wrap a receive buffer for dispatch.
    ///
    /// `bytes` is the full receive slot: `headroom` private bytes, then the
    /// payload. Transport drivers attach an [`RxCredit`] when they account
    /// outstanding descriptors.
    pub fn new(id: AmId, bytes: Box<[u8]>, headroom: usize, credit: Option<RxCredit>) -> Self {
        debug_assert!(headroom <= bytes.len());
        AmFrame {
            id,
            bytes,
            headroom,
            credit,
        }
    }

    pub fn id(&self) -> AmId {
        self.id
    }

    /// The payload.
    pub fn data(&self) -> &[u8] {
        &self.bytes[self.headroom..]
    }

    /// The protocol-private headroom preceding the payload.
    ///
    /// Writing here never affects the payload.
    pub fn headroom_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.headroom]
    }

    /// Take ownership of the descriptor past the handler call.
    ///
    /// The receive slot stays out of the transport's pool until the returned
    /// descriptor is released (or dropped). The handler must report
    /// [`AmAction::Held`] after calling this.
    pub fn into_held(self) -> HeldDesc {
        HeldDesc { inner: self }
    }
}

/// A receive descriptor owned by a handler beyond the dispatch call.
///
/// Obtained via [`AmFrame::into_held`]. [`HeldDesc::release`] (or drop)
/// returns the slot to the transport.
pub struct HeldDesc {
    inner: AmFrame,
}

impl HeldDesc {
    pub fn id(&self) -> AmId {
        self.inner.id
    }

    pub fn data(&self) -> &[u8] {
        self.inner.data()
    }

    pub fn headroom(&self) -> &[u8] {
        &self.inner.bytes[..self.inner.headroom]
    }

    pub fn headroom_mut(&mut self) -> &mut [u8] {
        self.inner.headroom_mut()
    }

    /// Give the receive slot back to the transport.
    pub fn release(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_frame: AmFrame) -> AmAction {
        AmAction::Done
    }

    const fn def(id: u8, features: Features) -> AmDef {
        AmDef {
            id: AmId(id),
            features,
            kind: AmKind::Sync,
            cb: nop,
            tracer: None,
        }
    }

    static TABLE: &[AmDef] = &[
        def(0, Features::AM),
        def(1, Features::RMA),
        def(5, Features::AM.union(Features::WAKEUP)),
    ];

    #[test]
    fn table_validates_and_gates() {
        let table = AmTable::new(TABLE).unwrap();
        let active: Vec<_> = table.active(Features::AM).map(|d| d.id).collect();
        assert_eq!(active, [AmId(0), AmId(5)]);
        assert!(table.active(Features::AMO32).next().is_none());
        assert_eq!(table.get(AmId(1)).map(|d| d.id), Some(AmId(1)));
    }

    #[test]
    fn table_rejects_duplicates_and_out_of_range() {
        static DUP: &[AmDef] = &[def(2, Features::AM), def(2, Features::AM)];
        static BIG: &[AmDef] = &[def(AM_ID_LAST as u8, Features::AM)];
        assert_eq!(AmTable::new(DUP).unwrap_err(), Status::InvalidParam);
        assert_eq!(AmTable::new(BIG).unwrap_err(), Status::InvalidParam);
    }

    #[test]
    fn frame_splits_headroom_and_payload() {
        let bytes = vec![0u8; 8 + 4].into_boxed_slice();
        let mut frame = AmFrame::new(AmId(3), bytes, 8, None);
        frame.headroom_mut().fill(0xaa);
        assert_eq!(frame.data().len(), 4);
        assert_eq!(frame.data(), &[0, 0, 0, 0]);
    }

    #[test]
    fn credit_tracks_outstanding() {
        let outstanding = Arc::new(AtomicUsize::new(0));
        let frame = AmFrame::new(
            AmId(0),
            vec![0u8; 4].into_boxed_slice(),
            0,
            Some(RxCredit::take(outstanding.clone())),
        );
        assert_eq!(outstanding.load(Ordering::Relaxed), 1);
        let held = frame.into_held();
        assert_eq!(outstanding.load(Ordering::Relaxed), 1);
        held.release();
        assert_eq!(outstanding.load(Ordering::Relaxed), 0);
    }
}
