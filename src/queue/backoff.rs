//! Retry backoff for failed queue deliveries.

/// Delay before the next retry, as plain data.
///
/// `base_ms * 2^tries`, saturating, capped at `cap_ms`. Pure so retry timing
/// is testable without a clock.
pub fn backoff_ms(base_ms: u64, cap_ms: u64, tries: u32) -> u64 {
  let factor = 1u64.checked_shl(tries).unwrap_or(u64::MAX);
  base_ms.saturating_mul(factor).min(cap_ms)
}
