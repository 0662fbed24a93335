//! Exponential backoff with full jitter.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]
use observability_deps::tracing::info;
use rand::prelude::*;
use std::ops::ControlFlow;
use std::time::Duration;

/// Exponential backoff with full jitter.
///
/// The delay before retry `n` is drawn uniformly from `[0, min(cap, base *
/// multiplier^n))`, per the "full jitter" strategy described in
/// <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>.
/// This spreads out retries from many concurrently-failing batches instead
/// of letting them all wake up in lockstep.
#[derive(Debug, Clone)]
#[allow(missing_copy_implementations)]
pub struct BackoffConfig {
    /// Initial backoff bound (the first retry's delay is drawn from
    /// `[0, init_backoff)`).
    pub init_backoff: Duration,

    /// Maximum backoff bound.
    pub max_backoff: Duration,

    /// Multiplier applied to the bound after each round.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.,
        }
    }
}

/// Backoff never gives up; retries continue indefinitely per the worker
/// group's "no poison-pill quarantine" policy.
pub type BackoffError = std::convert::Infallible;

/// Backoff result.
pub type BackoffResult<T> = Result<T, BackoffError>;

/// [`Backoff`] can be created from a [`BackoffConfig`].
///
/// Consecutive calls to [`Backoff::next`] return the next backoff interval,
/// growing the exponential bound each time until it saturates at
/// `max_backoff`.
pub struct Backoff {
    next_bound_secs: f64,
    max_backoff_secs: f64,
    multiplier: f64,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("next_bound_secs", &self.next_bound_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("multiplier", &self.multiplier)
            .finish()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`].
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new `Backoff` with the optional `rng`.
    ///
    /// Uses [`rand::thread_rng()`] if no rng is provided.
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        Self {
            next_bound_secs: config.init_backoff.as_secs_f64(),
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            multiplier: config.multiplier,
            rng,
        }
    }

    /// Returns the next backoff duration to wait for.
    fn next(&mut self) -> Duration {
        let bound = self.next_bound_secs;
        let range = 0.0..bound.max(f64::EPSILON);

        let jittered = match self.rng.as_mut() {
            Some(rng) => rng.gen_range(range),
            None => thread_rng().gen_range(range),
        };

        self.next_bound_secs = self.max_backoff_secs.min(bound * self.multiplier);
        Duration::from_secs_f64(jittered)
    }

    /// Perform an async operation that retries with a backoff.
    pub async fn retry_with_backoff<F, F1, B, E>(
        &mut self,
        task_name: &str,
        mut do_stuff: F,
    ) -> BackoffResult<B>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = ControlFlow<B, E>> + Send,
        E: std::error::Error + Send,
    {
        loop {
            // first execute `F` and then use it, so we can avoid `F: Sync`.
            let do_stuff = do_stuff();

            let e = match do_stuff.await {
                ControlFlow::Break(r) => break Ok(r),
                ControlFlow::Continue(e) => e,
            };

            let backoff = self.next();
            info!(
                e=%e,
                task_name,
                backoff_secs = backoff.as_secs_f64(),
                "request encountered non-fatal error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Retry all errors.
    pub async fn retry_all_errors<F, F1, B, E>(
        &mut self,
        task_name: &str,
        mut do_stuff: F,
    ) -> BackoffResult<B>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<B, E>> + Send,
        E: std::error::Error + Send,
    {
        self.retry_with_backoff(task_name, move || {
            // first execute `F` and then use it, so we can avoid `F: Sync`.
            let do_stuff = do_stuff();

            async {
                match do_stuff.await {
                    Ok(b) => ControlFlow::Break(b),
                    Err(e) => ControlFlow::Continue(e),
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn bound_saturates_at_max_and_never_exceeds_it() {
        let config = BackoffConfig {
            init_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.,
        };

        // Maximal rng draw always takes the top of the current range, which
        // directly exercises the bound growth curve.
        let rng = Box::new(StepRng::new(u64::MAX, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        let mut bound = 1.0_f64;
        for _ in 0..20 {
            let delay = backoff.next().as_secs_f64();
            assert!((delay - bound).abs() < 0.01, "{delay} != {bound}");
            bound = (bound * 2.).min(60.);
        }
        assert_eq!(bound, 60.);
    }

    #[test]
    fn minimal_draw_always_waits_zero() {
        let config = BackoffConfig::default();
        let rng = Box::new(StepRng::new(0, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        for _ in 0..10 {
            assert_eq!(backoff.next(), Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn retry_all_errors_stops_on_ok() {
        let mut backoff = Backoff::new_with_rng(
            &BackoffConfig::default(),
            Some(Box::new(StepRng::new(0, 0))),
        );

        let mut attempts = 0;
        let result = backoff
            .retry_all_errors::<_, _, _, std::io::Error>("test", || {
                attempts += 1;
                async move {
                    if attempts < 3 {
                        Err(std::io::Error::new(std::io::ErrorKind::Other, "not yet"))
                    } else {
                        Ok(attempts)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
    }
}
