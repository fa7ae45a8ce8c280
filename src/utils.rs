//! Utility functions for identifiers and retrying fallible calls

use std::thread;

use bech32::Bech32m;
use tracing::warn;
use uuid7::uuid7;

use crate::config::RetryPolicy;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Run `op` until it succeeds or the policy's attempts are used up, sleeping
/// with exponential backoff in between. Only use this for idempotent calls.
pub fn retry<T, F>(policy: &RetryPolicy, label: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> anyhow::Result<T>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                let delay = policy.delay_for(attempt);
                warn!(operation = label, attempt, ?delay, error = %err, "retrying after failure");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err.context(format!("{label} failed after {attempt} attempts"))),
        }
    }
}
