// ── Document id generation ──
//
// 12-byte ids rendered as 24 lowercase hex digits, laid out like the
// backing store's native ids: 4 bytes of seconds since the epoch, 5 bytes
// fixed per process, 3 bytes of a counter that starts at a random value.

use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use uuid::Uuid;

const COUNTER_MASK: u32 = 0x00ff_ffff;

struct ProcessSeed {
    unique: [u8; 5],
    counter: AtomicU32,
}

fn seed() -> &'static ProcessSeed {
    static SEED: OnceLock<ProcessSeed> = OnceLock::new();
    SEED.get_or_init(|| {
        let random = Uuid::new_v4().into_bytes();
        let mut unique = [0_u8; 5];
        unique.copy_from_slice(&random[..5]);
        let start = u32::from_be_bytes([0, random[10], random[11], random[12]]);
        ProcessSeed {
            unique,
            counter: AtomicU32::new(start),
        }
    })
}

/// Generate a new id.
pub fn generate() -> String {
    let seed = seed();
    // The field wraps in 2106.
    let seconds = u32::try_from(Utc::now().timestamp().rem_euclid(1 << 32)).unwrap_or_default();
    let counter = seed.counter.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;

    let mut bytes = [0_u8; 12];
    bytes[..4].copy_from_slice(&seconds.to_be_bytes());
    bytes[4..9].copy_from_slice(&seed.unique);
    bytes[9..].copy_from_slice(&counter.to_be_bytes()[1..]);

    bytes.iter().fold(String::with_capacity(24), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Whether `candidate` has the shape of a generated id.
pub fn is_valid(candidate: &str) -> bool {
    candidate.len() == 24 && candidate.bytes().all(|b| b.is_ascii_hexdigit())
}
