//! Deadline and inactivity supervision for one agent process.
//!
//! The agent can hang without exiting (a stalled network call, an approval
//! prompt nobody answers), so besides the absolute deadline there is an idle
//! watchdog fed by every byte read from stdout or stderr. Either trigger sends
//! SIGTERM to the process group, then SIGKILL once the grace period passes.

use std::time::Duration;

use tokio::process::Child;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};

use crate::config::BridgeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The absolute deadline passed.
    Deadline(Duration),
    /// No output for longer than the inactivity threshold.
    Inactivity(Duration),
}

impl TerminationReason {
    pub fn describe(&self) -> String {
        match self {
            Self::Deadline(limit) => {
                format!("request timed out after {}ms", limit.as_millis())
            }
            Self::Inactivity(idle) => {
                format!(
                    "agent produced no output for {}ms and timed out",
                    idle.as_millis()
                )
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    /// Send the graceful termination signal.
    Terminate(TerminationReason),
    /// The grace period ran out; force kill.
    Kill,
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub timeout: Duration,
    pub inactivity: Duration,
    pub grace: Duration,
    pub poll: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            timeout: config.timeout(),
            inactivity: config.inactivity_timeout(),
            grace: config.kill_grace(),
            poll: config.watchdog_interval(),
        }
    }
}

pub struct Supervisor {
    settings: SupervisorSettings,
    deadline: Instant,
    watchdog: Interval,
    last_activity: Instant,
    termination: Option<TerminationReason>,
    kill_at: Option<Instant>,
    killed: bool,
}

impl Supervisor {
    /// Start both timers now (at spawn).
    pub fn start(settings: SupervisorSettings) -> Self {
        let now = Instant::now();
        let mut watchdog = interval(settings.poll);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            settings,
            deadline: now + settings.timeout,
            watchdog,
            last_activity: now,
            termination: None,
            kill_at: None,
            killed: false,
        }
    }

    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    pub fn grace(&self) -> Duration {
        self.settings.grace
    }

    /// Resolve with the next action to apply to the process.
    ///
    /// Cancel safe: all state changes happen right before returning. Never
    /// resolves again once [`SupervisorAction::Kill`] was returned.
    pub async fn next_action(&mut self) -> SupervisorAction {
        if self.killed {
            return std::future::pending().await;
        }

        if let Some(kill_at) = self.kill_at {
            sleep_until(kill_at).await;
            self.killed = true;
            return SupervisorAction::Kill;
        }

        loop {
            tokio::select! {
                _ = sleep_until(self.deadline) => {
                    return self.begin_termination(TerminationReason::Deadline(self.settings.timeout));
                }
                _ = self.watchdog.tick() => {
                    let idle = self.idle_for();
                    if idle > self.settings.inactivity {
                        return self.begin_termination(TerminationReason::Inactivity(idle));
                    }
                }
            }
        }
    }

    fn begin_termination(&mut self, reason: TerminationReason) -> SupervisorAction {
        self.termination = Some(reason);
        self.kill_at = Some(Instant::now() + self.settings.grace);
        SupervisorAction::Terminate(reason)
    }
}

/// Ask the process group to exit (SIGTERM).
pub fn terminate_gracefully(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, nix::sys::signal::Signal::SIGTERM);
        return;
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "failed to terminate agent process");
    }
}

/// Kill the process group and the direct child (SIGKILL).
pub fn force_kill(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "failed to kill agent process");
    }
}

/// Signal the process group led by `pid`, falling back to the single process.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let target = Pid::from_raw(raw);
    if let Err(e) = killpg(target, signal) {
        tracing::debug!(pid, ?signal, error = %e, "killpg failed, signalling process");
        if let Err(e) = kill(target, signal) {
            tracing::debug!(pid, ?signal, error = %e, "kill failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(timeout: u64, inactivity: u64) -> SupervisorSettings {
        SupervisorSettings {
            timeout: Duration::from_secs(timeout),
            inactivity: Duration::from_secs(inactivity),
            grace: Duration::from_secs(2),
            poll: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_then_kill_escalation() {
        let start = Instant::now();
        let mut sup = Supervisor::start(settings(600, 5));

        let action = sup.next_action().await;
        assert!(matches!(
            action,
            SupervisorAction::Terminate(TerminationReason::Inactivity(_))
        ));
        let fired = start.elapsed();
        assert!(fired > Duration::from_secs(5) && fired <= Duration::from_secs(7), "{fired:?}");
        assert!(matches!(sup.termination(), Some(TerminationReason::Inactivity(_))));

        assert_eq!(sup.next_action().await, SupervisorAction::Kill);
        assert!(start.elapsed() >= fired + Duration::from_secs(2));

        let again = tokio::time::timeout(Duration::from_secs(3600), sup.next_action()).await;
        assert!(again.is_err(), "no further actions after kill");
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_defers_watchdog_until_deadline() {
        let start = Instant::now();
        let mut sup = Supervisor::start(settings(20, 5));

        let action = loop {
            tokio::select! {
                action = sup.next_action() => break action,
                _ = tokio::time::sleep(Duration::from_secs(3)) => sup.record_activity(),
            }
        };

        assert_eq!(
            action,
            SupervisorAction::Terminate(TerminationReason::Deadline(Duration::from_secs(20)))
        );
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[test]
    fn test_reason_descriptions_classify_as_timeout() {
        use crate::classify::{match_category, ErrorCategory};

        for reason in [
            TerminationReason::Deadline(Duration::from_secs(30)),
            TerminationReason::Inactivity(Duration::from_secs(9)),
        ] {
            assert_eq!(match_category(&reason.describe()), Some(ErrorCategory::Timeout));
        }
    }
}
