//! Submit-then-poll: wait for the authority to sign a submitted request.
//!
//! Flow:
//!   1. Fetch the certificate for the handle
//!   2. Pending (empty certificate) or a transient transport error: sleep the
//!      poll delay and try again
//!   3. Signed: done. Anything else (decode failure, unknown handle): fail
//!
//! The loop runs as its own task racing a deadline. When the deadline wins,
//! the task is aborted and the caller gets [`CertError::TimedOut`]; a fetch
//! that stalls its thread cannot hold the deadline back.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::Instant;

use crate::authority::{Authority, Certificate, FetchOutcome, IssuanceHandle};
use crate::error::{CertError, Result};

pub const FETCH_DELAY:   Duration = Duration::from_secs(1);
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Overall deadline for the signed certificate.
    pub timeout: Duration,
    /// Pause between two fetches.
    pub delay:   Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self { timeout: FETCH_TIMEOUT, delay: FETCH_DELAY }
    }
}

/// Why a fetch did not end the wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    Pending,
    Transport(String),
}

/// A signed certificate together with how the wait went.
#[derive(Debug, Clone)]
pub struct Issued {
    pub certificate: Certificate,
    pub attempts:    u32,
    pub retries:     Vec<RetryReason>,
    pub elapsed:     Duration,
}

pub struct IssuanceWaiter<A: Authority + ?Sized + 'static> {
    authority: Arc<A>,
    policy:    WaitPolicy,
}

impl<A: Authority + ?Sized + 'static> IssuanceWaiter<A> {
    pub fn new(authority: Arc<A>, policy: WaitPolicy) -> Self {
        Self { authority, policy }
    }

    /// Poll until `handle` is signed or the deadline passes.
    pub async fn wait(&self, handle: &IssuanceHandle) -> Result<Issued> {
        let started = Instant::now();
        info!(
            "waiting up to {:?} for certificate {handle} to be signed",
            self.policy.timeout
        );
        let mut task = tokio::spawn(poll(
            Arc::clone(&self.authority),
            *handle,
            self.policy.delay,
            started,
        ));
        match tokio::time::timeout(self.policy.timeout, &mut task).await {
            Ok(joined) => joined?,
            Err(_) => {
                task.abort();
                warn!("timed out after {:?} waiting for certificate {handle}", self.policy.timeout);
                Err(CertError::TimedOut {
                    what:  format!("certificate {handle}"),
                    after: self.policy.timeout,
                })
            }
        }
    }
}

/// Strictly sequential fetches; never two in flight for one handle.
async fn poll<A: Authority + ?Sized>(
    authority: Arc<A>,
    handle:    IssuanceHandle,
    delay:     Duration,
    started:   Instant,
) -> Result<Issued> {
    let mut attempts = 0u32;
    let mut retries = Vec::new();
    loop {
        attempts += 1;
        let reason = match authority.fetch_certificate(&handle).await {
            Ok(FetchOutcome::Signed(certificate)) => {
                let elapsed = started.elapsed();
                info!(
                    "certificate {handle} signed as {:?} after {attempts} attempt(s) in {elapsed:?}",
                    certificate.name()
                );
                return Ok(Issued { certificate, attempts, retries, elapsed });
            }
            Ok(FetchOutcome::Pending { .. }) => RetryReason::Pending,
            Err(e) if e.is_transient() => RetryReason::Transport(e.to_string()),
            Err(e) => {
                error!("certificate {handle}: giving up after {attempts} attempt(s): {e}");
                return Err(e);
            }
        };
        match &reason {
            RetryReason::Pending => debug!(
                target: "cert_client::waiter",
                "reason=pending handle={handle} attempt={attempts}"
            ),
            RetryReason::Transport(e) => debug!(
                target: "cert_client::waiter",
                "reason=transport handle={handle} attempt={attempts} error={e}"
            ),
        }
        retries.push(reason);
        tokio::time::sleep(delay).await;
    }
}
