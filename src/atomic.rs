//! Atomic-resource selection: which interfaces carry one-sided atomic
//! operations.

use crate::am::Features;
use crate::config::AtomicMode;
use crate::tl::{IfaceCaps, IfaceFlags, IfacePerf, ResourceDesc};

/// Transport flags an interface must advertise to carry the full atomic
/// set implied by the context features.
pub(crate) fn required_flags(features: Features) -> IfaceFlags {
    let mut flags = IfaceFlags::empty();
    if features.contains(Features::AMO32) {
        flags |= IfaceFlags::ATOMIC_ADD32
            | IfaceFlags::ATOMIC_FADD32
            | IfaceFlags::ATOMIC_SWAP32
            | IfaceFlags::ATOMIC_CSWAP32;
    }
    if features.contains(Features::AMO64) {
        flags |= IfaceFlags::ATOMIC_ADD64
            | IfaceFlags::ATOMIC_FADD64
            | IfaceFlags::ATOMIC_SWAP64
            | IfaceFlags::ATOMIC_CSWAP64;
    }
    flags
}

/// Wire-up estimate for a single atomic element.
///
/// Candidates are ranked by their distance from a virtual ideal interface
/// (infinite bandwidth, zero overhead); with the element size fixed that
/// reduces to the inverse per-operation completion time, so higher is
/// better.
fn amo_score(perf: &IfacePerf) -> f64 {
    let elem_size = 8.0;
    1.0 / (perf.overhead + elem_size / perf.bandwidth)
}

/// Select the interfaces carrying atomics; returns the `atomic_tls`
/// bitmask over resource indices.
pub(crate) fn select(
    mode: AtomicMode,
    features: Features,
    ifaces: &[(&ResourceDesc, &IfaceCaps)],
) -> u64 {
    if !features.intersects(Features::AMO32 | Features::AMO64) {
        return 0;
    }
    match mode {
        AtomicMode::Cpu => select_cpu(ifaces),
        AtomicMode::Device => select_device(features, ifaces),
        AtomicMode::Guess => {
            let any_device = ifaces
                .iter()
                .any(|(_, caps)| caps.flags.contains(IfaceFlags::ATOMIC_DEVICE));
            if any_device {
                select_device(features, ifaces)
            } else {
                select_cpu(ifaces)
            }
        }
    }
}

fn select_cpu(ifaces: &[(&ResourceDesc, &IfaceCaps)]) -> u64 {
    let mut mask = 0u64;
    for (index, (_, caps)) in ifaces.iter().enumerate() {
        if caps.flags.contains(IfaceFlags::ATOMIC_CPU) {
            mask |= 1 << index;
        }
    }
    mask
}

fn select_device(features: Features, ifaces: &[(&ResourceDesc, &IfaceCaps)]) -> u64 {
    let required = required_flags(features) | IfaceFlags::ATOMIC_DEVICE;

    let mut best: Option<(usize, f64)> = None;
    for (index, (desc, caps)) in ifaces.iter().enumerate() {
        if !desc.md_supports_reg || !caps.flags.contains(required) {
            continue;
        }
        let score = amo_score(&caps.perf);
        let better = match best {
            None => true,
            Some((best_index, best_score)) => {
                score > best_score
                    || (score == best_score
                        && caps.perf.priority > ifaces[best_index].1.perf.priority)
            }
        };
        if better {
            best = Some((index, score));
        }
    }

    let Some((winner, score)) = best else {
        log::debug!("atomic selection: no device-capable interface, atomics stay disabled");
        return 0;
    };
    let (winner_desc, winner_caps) = ifaces[winner];
    log::debug!(
        "atomic selection: {}/{} wins with score {:.3e} (priority {})",
        winner_desc.tl_name,
        winner_desc.dev_name,
        score,
        winner_caps.perf.priority,
    );

    // Atomics must stay on one coherence domain: enable every interface of
    // the winning memory domain and device.
    let mut mask = 0u64;
    for (index, (desc, _)) in ifaces.iter().enumerate() {
        if desc.md_index == winner_desc.md_index && desc.dev_name == winner_desc.dev_name {
            mask |= 1 << index;
        }
    }
    mask
}
