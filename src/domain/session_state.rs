use crate::domain::debouncer::ButtonEvent;
use crate::domain::energy::{self, EnergyReading};
use crate::domain::models::{
    DeviceConfig, DeviceState, RemoteCallOutcome, StatusColor, WorkSession,
};

/// Share of the configured work day that counts as a completed day.
pub const WORKDAY_COMPLETE_RATIO: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimestampMs(pub i64);

impl TimestampMs {
    pub fn as_seconds(self) -> i64 {
        self.0.div_euclid(1000)
    }
}

pub trait Clock {
    fn now(&self) -> TimestampMs;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    ClockIn,
    ClockOut { session_id: String },
}

/// Side effects requested by a transition, in the order they must be applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SetBrightness(u8),
    SetStatus(StatusColor),
    Pulse(StatusColor),
    EnergyMeter(EnergyReading),
    Celebrate,
    ClearDisplay,
    PersistSession(WorkSession),
    ClearPersistedSession,
    Issue(RemoteCommand),
    AwaitErrorDisplay,
    EnterProvisioning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceContext {
    pub state: DeviceState,
    pub session: WorkSession,
    pub config: DeviceConfig,
}

#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    context: DeviceContext,
    pending: Option<RemoteCommand>,
    revert_to: Option<DeviceState>,
    last_error: Option<String>,
    energy_interval_ms: i64,
    last_energy_update: Option<TimestampMs>,
}

impl SessionStateMachine {
    pub fn new(config: DeviceConfig, energy_interval_ms: u64) -> Self {
        Self {
            context: DeviceContext {
                state: DeviceState::Startup,
                session: WorkSession::default(),
                config,
            },
            pending: None,
            revert_to: None,
            last_error: None,
            energy_interval_ms: i64::try_from(energy_interval_ms).unwrap_or(i64::MAX),
            last_energy_update: None,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.context.state
    }

    pub fn session(&self) -> &WorkSession {
        &self.context.session
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn begin_connecting(&mut self) -> Vec<Effect> {
        if self.context.state != DeviceState::Startup {
            return Vec::new();
        }

        self.transition(DeviceState::WifiConnecting);
        vec![
            Effect::SetBrightness(self.context.config.brightness),
            Effect::SetStatus(StatusColor::Blue),
        ]
    }

    pub fn boot_completed<C: Clock>(
        &mut self,
        saved: Option<WorkSession>,
        clock: &C,
    ) -> Vec<Effect> {
        if !matches!(
            self.context.state,
            DeviceState::Startup | DeviceState::WifiConnecting
        ) {
            return Vec::new();
        }

        match saved.filter(WorkSession::is_active) {
            Some(mut session) => {
                let now_seconds = clock.now().as_seconds();
                if session.start_time > now_seconds {
                    tracing::warn!(
                        stored_start = session.start_time,
                        now = now_seconds,
                        "restored session starts in the future; clamping to now"
                    );
                    session.start_time = now_seconds;
                }

                tracing::info!(session_id = %session.session_id, "restored active session");
                self.context.session = session;
                self.last_energy_update = None;
                self.transition(DeviceState::WorkingClockedIn);
                vec![Effect::SetStatus(StatusColor::Green)]
            }
            None => {
                self.transition(DeviceState::IdleClockedOut);
                vec![Effect::SetStatus(StatusColor::Red)]
            }
        }
    }

    pub fn require_provisioning(&mut self) -> Vec<Effect> {
        if self.context.state == DeviceState::ConfigMode {
            return Vec::new();
        }

        self.pending = None;
        self.revert_to = None;
        self.transition(DeviceState::ConfigMode);
        vec![
            Effect::SetStatus(StatusColor::White),
            Effect::EnterProvisioning,
        ]
    }

    pub fn on_button(&mut self, event: ButtonEvent) -> Vec<Effect> {
        match (event, self.context.state) {
            (ButtonEvent::LongPress, _) => self.require_provisioning(),
            (ButtonEvent::Pressed, DeviceState::IdleClockedOut) => {
                tracing::info!("clock in requested");
                self.issue(RemoteCommand::ClockIn, DeviceState::IdleClockedOut)
            }
            (ButtonEvent::Pressed, DeviceState::WorkingClockedIn) => {
                tracing::info!(
                    session_id = %self.context.session.session_id,
                    "clock out requested"
                );
                let command = RemoteCommand::ClockOut {
                    session_id: self.context.session.session_id.clone(),
                };
                self.issue(command, DeviceState::WorkingClockedIn)
            }
            (ButtonEvent::Pressed, state) => {
                tracing::debug!(state = ?state, "press ignored in current state");
                Vec::new()
            }
            (ButtonEvent::Released | ButtonEvent::None, _) => Vec::new(),
        }
    }

    pub fn on_remote_result<C: Clock>(
        &mut self,
        outcome: RemoteCallOutcome,
        clock: &C,
    ) -> Vec<Effect> {
        if self.context.state != DeviceState::ApiCalling {
            tracing::warn!(
                state = ?self.context.state,
                "remote result arrived outside of a call"
            );
            return Vec::new();
        }

        let Some(command) = self.pending.take() else {
            tracing::warn!("remote result arrived without a pending command");
            return Vec::new();
        };

        match command {
            RemoteCommand::ClockIn => self.finish_clock_in(outcome, clock.now()),
            RemoteCommand::ClockOut { .. } => self.finish_clock_out(outcome, clock.now()),
        }
    }

    /// Ends the error display and returns to the state held before the failed call.
    pub fn resolve_error(&mut self) -> Vec<Effect> {
        if self.context.state != DeviceState::Error {
            return Vec::new();
        }

        let target = self.revert_to.take().unwrap_or(DeviceState::IdleClockedOut);
        self.transition(target);

        match target {
            DeviceState::WorkingClockedIn => vec![Effect::SetStatus(StatusColor::Green)],
            _ => vec![Effect::SetStatus(StatusColor::Red)],
        }
    }

    pub fn tick<C: Clock>(&mut self, clock: &C) -> Vec<Effect> {
        if self.context.state != DeviceState::WorkingClockedIn
            || !self.context.session.is_active()
        {
            return Vec::new();
        }

        let now = clock.now();
        let due = match self.last_energy_update {
            Some(last) => now.0.saturating_sub(last.0) >= self.energy_interval_ms,
            None => true,
        };
        if !due {
            return Vec::new();
        }

        self.last_energy_update = Some(now);
        vec![Effect::EnergyMeter(self.energy_reading(now))]
    }

    pub fn energy_reading(&self, now: TimestampMs) -> EnergyReading {
        let elapsed = self.context.session.elapsed_seconds(now.as_seconds());
        energy::reading(elapsed, self.context.config.work_day_seconds())
    }

    fn issue(&mut self, command: RemoteCommand, from: DeviceState) -> Vec<Effect> {
        self.pending = Some(command.clone());
        self.revert_to = Some(from);
        self.transition(DeviceState::ApiCalling);
        vec![Effect::Pulse(StatusColor::Blue), Effect::Issue(command)]
    }

    fn finish_clock_in(&mut self, outcome: RemoteCallOutcome, now: TimestampMs) -> Vec<Effect> {
        let session_id = outcome
            .session_id
            .clone()
            .filter(|value| !value.is_empty());

        let Some(session_id) = session_id.filter(|_| outcome.success) else {
            return self.fail(&outcome);
        };

        let session = WorkSession::open(session_id, now.as_seconds());
        tracing::info!(
            session_id = %session.session_id,
            start_time = session.start_time,
            attempts = outcome.attempts,
            "clocked in"
        );

        self.context.session = session.clone();
        self.revert_to = None;
        self.last_error = None;
        self.last_energy_update = Some(now);
        self.transition(DeviceState::WorkingClockedIn);

        vec![
            Effect::PersistSession(session),
            Effect::SetStatus(StatusColor::Green),
            Effect::EnergyMeter(self.energy_reading(now)),
        ]
    }

    fn finish_clock_out(&mut self, outcome: RemoteCallOutcome, now: TimestampMs) -> Vec<Effect> {
        if !outcome.success {
            return self.fail(&outcome);
        }

        let elapsed = self.context.session.elapsed_seconds(now.as_seconds());
        let work_day = self.context.config.work_day_seconds();
        tracing::info!(
            session_id = %self.context.session.session_id,
            worked_seconds = elapsed,
            worked_hours = elapsed as f64 / 3600.0,
            "clocked out"
        );

        let mut effects = Vec::new();
        if work_day > 0 && elapsed as f64 >= WORKDAY_COMPLETE_RATIO * work_day as f64 {
            tracing::info!(worked_seconds = elapsed, "workday complete");
            effects.push(Effect::Celebrate);
        }

        self.context.session = WorkSession::default();
        self.revert_to = None;
        self.last_error = None;
        self.last_energy_update = None;
        self.transition(DeviceState::IdleClockedOut);

        effects.extend([
            Effect::ClearPersistedSession,
            Effect::ClearDisplay,
            Effect::SetStatus(StatusColor::Red),
        ]);
        effects
    }

    fn fail(&mut self, outcome: &RemoteCallOutcome) -> Vec<Effect> {
        let message = if outcome.success {
            "response did not carry a session id".to_string()
        } else {
            outcome.error_message()
        };

        tracing::error!(
            error = %message,
            status_code = ?outcome.status_code,
            attempts = outcome.attempts,
            revert_to = ?self.revert_to,
            "remote call failed"
        );

        self.last_error = Some(message);
        self.transition(DeviceState::Error);
        vec![Effect::Pulse(StatusColor::Yellow), Effect::AwaitErrorDisplay]
    }

    fn transition(&mut self, next: DeviceState) {
        let previous = std::mem::replace(&mut self.context.state, next);
        if previous != next {
            tracing::info!(from = ?previous, to = ?next, "device state changed");
        }
    }
}
