//! Safe-mode gate: admits or rejects namespace mutations.
//!
//! Entering safe mode flips the gate and then waits for in-flight mutations
//! to drain, so a checkpoint never observes a half-applied change. Reads do
//! not pass through the gate at all.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

use crate::{FsMetaError, FsMetaResult};

#[derive(Debug, Default)]
struct GateState {
    entered: bool,
    in_flight: u64,
}

pub struct SafeModeGate {
    state: Mutex<GateState>,
    // mirrors GateState::in_flight so enter() can wait for drain
    drain: watch::Sender<u64>,
}

impl SafeModeGate {
    pub fn new() -> Self {
        let (drain, _) = watch::channel(0);
        Self {
            state: Mutex::new(GateState::default()),
            drain,
        }
    }

    fn lock_state(&self) -> FsMetaResult<std::sync::MutexGuard<'_, GateState>> {
        self.state
            .lock()
            .map_err(|e| FsMetaError::Internal(format!("safe mode gate lock poisoned: {}", e)))
    }

    pub fn is_entered(&self) -> bool {
        self.lock_state().map(|st| st.entered).unwrap_or(false)
    }

    /// Enter safe mode (idempotent) and wait up to `drain_timeout` for
    /// in-flight mutations to finish. On timeout the gate stays entered so
    /// new mutations remain blocked; the caller may retry or leave.
    pub async fn enter(&self, drain_timeout: Duration) -> FsMetaResult<()> {
        {
            let mut st = self.lock_state()?;
            st.entered = true;
            if st.in_flight == 0 {
                return Ok(());
            }
            info!(
                "safe mode entered, draining {} in-flight mutations",
                st.in_flight
            );
        }
        let mut rx = self.drain.subscribe();
        let wait = async { rx.wait_for(|v| *v == 0).await.map(|_| ()) };
        match tokio::time::timeout(drain_timeout, wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(FsMetaError::Internal(format!(
                "safe mode drain channel closed: {}",
                e
            ))),
            Err(_) => Err(FsMetaError::SafeModeDrainTimeout(format!(
                "in-flight mutations did not drain within {:?}",
                drain_timeout
            ))),
        }
    }

    /// Leave safe mode (idempotent).
    pub fn leave(&self) -> FsMetaResult<()> {
        let mut st = self.lock_state()?;
        st.entered = false;
        Ok(())
    }

    /// Admit one structural mutation. Rejected while the gate is entered;
    /// otherwise the returned guard counts the mutation as in flight until
    /// dropped.
    pub fn begin_mutation(&self) -> FsMetaResult<MutationGuard<'_>> {
        let mut st = self.lock_state()?;
        if st.entered {
            return Err(FsMetaError::SafeModeViolation(
                "namespace is in safe mode".to_string(),
            ));
        }
        st.in_flight += 1;
        let _ = self.drain.send_replace(st.in_flight);
        Ok(MutationGuard { gate: self })
    }
}

impl Default for SafeModeGate {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MutationGuard<'a> {
    gate: &'a SafeModeGate,
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut st) = self.gate.state.lock() {
            st.in_flight = st.in_flight.saturating_sub(1);
            let _ = self.gate.drain.send_replace(st.in_flight);
        }
    }
}
