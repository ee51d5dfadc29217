use std::time::Instant;

#[inline]
pub fn now_monotonic() -> Instant {
    Instant::now()
}
