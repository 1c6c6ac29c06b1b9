//! Bandwidth limiting for in-process transfers

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::io::{self, Read, Write};
use std::num::NonZeroU32;
use tokio_util::sync::CancellationToken;

const MAX_CHUNK: usize = 32 * 1024;

/// Average throughput bound for one transfer, in bytes per second
pub struct Throttle {
    limiter: Option<DefaultDirectRateLimiter>,
    clock: DefaultClock,
    chunk: usize,
}

impl Throttle {
    /// Build from a Kbit/s limit; 0 means unlimited
    pub fn new(limit_kbps: u32) -> Self {
        let bytes_per_sec = limit_kbps.saturating_mul(1024) / 8;
        match NonZeroU32::new(bytes_per_sec) {
            Some(rate) => Self {
                limiter: Some(RateLimiter::direct(Quota::per_second(rate))),
                clock: DefaultClock::default(),
                // a single request must fit in the burst
                chunk: MAX_CHUNK.min(rate.get() as usize),
            },
            None => Self::unlimited(),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            limiter: None,
            clock: DefaultClock::default(),
            chunk: MAX_CHUNK,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk
    }

    /// Block the current thread until `n` bytes may pass
    pub fn wait(&self, n: usize) {
        let Some(limiter) = &self.limiter else {
            return;
        };
        let Some(cells) = NonZeroU32::new(n.min(self.chunk) as u32) else {
            return;
        };
        loop {
            match limiter.check_n(cells) {
                Ok(Ok(())) => return,
                Ok(Err(not_until)) => {
                    std::thread::sleep(not_until.wait_time_from(self.clock.now()));
                }
                // larger than the burst capacity; chunk sizing prevents this
                Err(_) => return,
            }
        }
    }
}

/// Copy `reader` into `writer` under `throttle`, checking `cancel` between chunks.
///
/// Blocking; call from a blocking context.
pub fn copy_throttled<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    throttle: &Throttle,
    cancel: &CancellationToken,
) -> io::Result<u64> {
    let mut buf = vec![0u8; throttle.chunk_size()];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "transfer cancelled"));
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        throttle.wait(n);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}
