//! Context-wide and per-worker configuration.

use std::sync::Arc;

use crate::am::Features;
use crate::sys::CpuSet;
use crate::tl::loopback::Loopback;
use crate::tl::Component;

/// Threading contract of a worker, chosen at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadMode {
    /// No locking; all worker calls must originate from one thread.
    /// (`signal` stays safe from any thread.)
    #[default]
    Single,
    /// Public worker operations serialize through a lock.
    Multi,
}

/// Placement policy for one-sided atomic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AtomicMode {
    /// Every interface executing atomics on the host CPU.
    Cpu,
    /// The best device-atomic interface and its device siblings.
    Device,
    /// `Device` when any interface advertises device atomics, else `Cpu`.
    #[default]
    Guess,
}

/// Environment variable filtering the transports considered at context
/// creation: a comma-separated allow list, or a deny list with a leading
/// `^`. Unset or empty admits everything.
pub const TLS_ENV: &str = "FABRIQ_TLS";

/// Context construction options.
pub struct ContextConfig {
    /// Feature set; gates AM-id installation and atomic selection.
    pub features: Features,
    pub atomic_mode: AtomicMode,
    /// Multi-threaded workers serialize through a blocking mutex instead
    /// of the default spinlock.
    pub use_mt_mutex: bool,
    /// Protocol-private bytes ahead of every receive payload.
    pub rx_headroom: usize,
    /// Extra bytes appended to every pooled request element.
    pub request_trailer: usize,
    /// Transport drivers to enumerate. Defaults to the built-in set.
    pub components: Vec<Arc<dyn Component>>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            features: Features::AM | Features::WAKEUP | Features::AMO32 | Features::AMO64,
            atomic_mode: AtomicMode::default(),
            use_mt_mutex: false,
            rx_headroom: 64,
            request_trailer: 32,
            components: vec![Arc::new(Loopback)],
        }
    }
}

/// Worker construction options. Unrecognized concerns keep their documented
/// defaults: single-threaded, empty CPU mask.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerParams {
    pub thread_mode: ThreadMode,
    /// Affinity handed to transport helper threads.
    pub cpu_mask: CpuSet,
}

/// Parsed transport-list selector.
pub(crate) struct TlsFilter {
    names: Vec<String>,
    negate: bool,
}

impl TlsFilter {
    pub fn from_env() -> Self {
        TlsFilter::parse(std::env::var(TLS_ENV).ok().as_deref())
    }

    pub fn parse(spec: Option<&str>) -> Self {
        let spec = spec.map(str::trim).unwrap_or("");
        let (negate, list) = match spec.strip_prefix('^') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };
        let names = list
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect();
        TlsFilter { names, negate }
    }

    pub fn admits(&self, tl_name: &str) -> bool {
        if self.names.is_empty() {
            return true;
        }
        let listed = self.names.iter().any(|name| name == tl_name);
        listed != self.negate
    }
}
