//! Two workers exchanging active messages over the loopback transport,
//! with the receiver blocking on the worker event descriptor between
//! batches.

use core::sync::atomic::{AtomicU64, Ordering};

use fabriq::am::{AmAction, AmDef, AmFrame, AmId, AmKind, Features};
use fabriq::{Context, ContextConfig, Status, ThreadMode, WorkerParams};

const AM_PING: AmId = AmId(1);

static RECEIVED: AtomicU64 = AtomicU64::new(0);
static BYTES: AtomicU64 = AtomicU64::new(0);

fn ping_handler(frame: AmFrame) -> AmAction {
    RECEIVED.fetch_add(1, Ordering::Relaxed);
    BYTES.fetch_add(frame.data().len() as u64, Ordering::Relaxed);
    AmAction::Done
}

static DEFS: &[AmDef] = &[AmDef {
    id: AM_PING,
    features: Features::AM,
    kind: AmKind::Sync,
    cb: ping_handler,
    tracer: None,
}];

#[derive(clap::Parser)]
struct Args {
    /// Total number of messages to push.
    #[arg(long)]
    total: Option<u64>,
    /// Messages per batch between wakeups.
    #[arg(long)]
    batch: Option<u64>,
    /// Payload size in bytes.
    #[arg(long)]
    payload: Option<usize>,
}

fn main() {
    env_logger::init();
    let args = <Args as clap::Parser>::parse();
    let total = args.total.unwrap_or(1 << 16);
    let batch = args.batch.unwrap_or(1 << 10);
    let payload = vec![0x5au8; args.payload.unwrap_or(512)];

    let context = Context::new(ContextConfig::default(), DEFS).unwrap();
    let receiver = context
        .worker(&WorkerParams {
            thread_mode: ThreadMode::Multi,
            ..WorkerParams::default()
        })
        .unwrap();
    let sender = context.worker(&WorkerParams::default()).unwrap();

    let ep = sender.get_reply_ep(receiver.uuid()).unwrap();
    sender.progress();

    eprintln!(
        "pushing {total} messages of {} B from {} to {}",
        payload.len(),
        sender.name(),
        receiver.name(),
    );

    let start = std::time::Instant::now();
    let mut sent = 0;
    while sent < total {
        let now = batch.min(total - sent);
        for _ in 0..now {
            sender.am_send(ep, AM_PING, &payload).unwrap();
        }
        sent += now;

        // Block until the batch shows up, then drain it.
        while RECEIVED.load(Ordering::Relaxed) < sent {
            match receiver.wait() {
                Ok(()) => {}
                Err(Status::Busy) | Err(Status::InProgress) => {}
                Err(err) => panic!("wait failed: {err}"),
            }
            receiver.progress();
        }
    }
    let elapsed = start.elapsed();

    eprintln!(
        "done: {} messages, {} MB in {elapsed:?}",
        RECEIVED.load(Ordering::Relaxed),
        BYTES.load(Ordering::Relaxed) / (1 << 20),
    );
    let mut info = Vec::new();
    receiver.print_info(&mut info).unwrap();
    eprint!("{}", String::from_utf8_lossy(&info));
}
