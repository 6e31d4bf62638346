use serde::Serialize;

use crate::{
    error::SetupError,
    options::{Ddir, JobOptions, PerDdir},
};

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Pacing state of one direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RateLimit {
    /// Enforced delay per byte of work.
    pub nsec_cycle: u64,
    /// Sleep owed but not yet taken.
    pub pending_sleep_us: i64,
}

fn setup_ddir(opts: &JobOptions, ddir: Ddir) -> Result<RateLimit, SetupError> {
    let bytes_per_sec = if opts.rate[ddir] != 0 {
        Some(opts.rate[ddir])
    } else {
        opts.rate_iops[ddir].checked_mul(u64::from(opts.min_bs[ddir]))
    };

    match bytes_per_sec {
        Some(bps) if bps != 0 => Ok(RateLimit {
            nsec_cycle: NSEC_PER_SEC / bps,
            pending_sleep_us: 0,
        }),
        _ => Err(SetupError::InvalidRate { ddir }),
    }
}

/// Derive pacing for every direction that has a rate target. Directions
/// without one stay `None` and are never paced.
pub fn setup_rate(opts: &JobOptions) -> Result<PerDdir<Option<RateLimit>>, SetupError> {
    let mut out = PerDdir::default();
    for ddir in Ddir::ALL {
        if opts.rate[ddir] != 0 || opts.rate_iops[ddir] != 0 {
            out[ddir] = Some(setup_ddir(opts, ddir)?);
        }
    }
    Ok(out)
}
