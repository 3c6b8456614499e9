use std::time::Duration;

/// Exponential backoff with jitter: base 1s, factor 2, jitter +/-20%,
/// cap 60s (§4.2 `Fail`).
pub fn retry_delay(retry_count: i32) -> Duration {
    const BASE_SECS: f64 = 1.0;
    const FACTOR: f64 = 2.0;
    const CAP_SECS: f64 = 60.0;
    const JITTER: f64 = 0.20;

    let raw = BASE_SECS * FACTOR.powi(retry_count.max(0));
    let capped = raw.min(CAP_SECS);

    let jitter_span = capped * JITTER;
    let offset = (fastrand::f64() * 2.0 - 1.0) * jitter_span;
    let jittered = (capped + offset).max(0.0);

    Duration::from_secs_f64(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let d0 = retry_delay(0).as_secs_f64();
        let d3 = retry_delay(3).as_secs_f64();
        let d10 = retry_delay(10).as_secs_f64();

        assert!(d0 >= 0.8 && d0 <= 1.2);
        assert!(d3 >= 6.4 && d3 <= 9.6);
        assert!(d10 <= 72.0);
        assert!(d10 >= 48.0);
    }
}
