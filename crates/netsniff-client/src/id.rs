//! Correlation identifiers for captured exchanges

use rand::Rng;
use std::collections::HashSet;
use std::sync::Mutex;

/// Range the random suffix is drawn from (5 digits)
const SUFFIX_RANGE: std::ops::Range<u32> = 10_000..99_999;

/// Suffixes already handed out in the current millisecond
static ISSUED: Mutex<Option<(i64, HashSet<u32>)>> = Mutex::new(None);

/// Generate an exchange identifier: `{epoch_millis}-{random}`.
///
/// Identifiers sort roughly by creation time (the suffix does not order).
/// Within this process a suffix is never reused inside one millisecond, so
/// ids only collide across processes, where two ids generated in the same
/// millisecond share a suffix with probability 1/89999. Not a cryptographic
/// identifier.
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let mut issued = ISSUED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    loop {
        let timestamp = chrono::Utc::now().timestamp_millis();
        if issued
            .as_ref()
            .map_or(true, |(millis, _)| *millis != timestamp)
        {
            *issued = Some((timestamp, HashSet::new()));
        }
        let (_, used) = issued.get_or_insert_with(|| (timestamp, HashSet::new()));

        // Every suffix of this millisecond is taken; wait for the clock
        if used.len() >= SUFFIX_RANGE.len() {
            std::hint::spin_loop();
            continue;
        }

        loop {
            let suffix = rng.gen_range(SUFFIX_RANGE);
            if used.insert(suffix) {
                return format!("{}-{}", timestamp, suffix);
            }
        }
    }
}

/// Current wall clock time in epoch milliseconds
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
