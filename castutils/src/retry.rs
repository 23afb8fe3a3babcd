//! Bounded retry for transient failures.

use std::time::Duration;

use tracing::warn;

/// Run `op` up to `attempts` times, pausing `delay` between attempts.
///
/// The closure receives the 1-based attempt number. The error of the last
/// attempt is returned once all attempts are exhausted; intermediate
/// failures are logged at warn level.
pub fn retry<T, E, F>(attempts: usize, delay: Duration, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut(usize) -> Result<T, E>,
{
    debug_assert!(attempts >= 1);

    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < attempts {
                    warn!("Attempt {}/{} failed: {}, retrying", attempt, attempts, e);
                    std::thread::sleep(delay);
                } else {
                    warn!("Attempt {}/{} failed: {}, giving up", attempt, attempts, e);
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.expect("at least one attempt was made"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_first_try() {
        let mut calls = 0;
        let result: Result<u32, String> = retry(3, Duration::ZERO, |_| {
            calls += 1;
            Ok(42)
        });
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_succeeds_after_failures() {
        let mut calls = 0;
        let result: Result<u32, String> = retry(3, Duration::ZERO, |attempt| {
            calls += 1;
            if attempt < 3 {
                Err("transient".to_string())
            } else {
                Ok(7)
            }
        });
        assert_eq!(result, Ok(7));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_exhausts_attempts() {
        let mut calls = 0;
        let result: Result<u32, String> = retry(3, Duration::ZERO, |_| {
            calls += 1;
            Err("down".to_string())
        });
        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls, 3);
    }
}
