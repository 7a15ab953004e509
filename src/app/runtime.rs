use std::collections::VecDeque;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use actix_web::{App, HttpServer, web};
use chrono::{SecondsFormat, Utc};

use crate::adapters::api::{ApiState, configure_routes, cors};
use crate::adapters::display::{Display, FrameDisplay, SharedSnapshot};
use crate::adapters::http_transport::ReqwestTransport;
use crate::adapters::remote_session::{
    RemoteSessionClient, RetryPolicy, SessionApi, Sleeper, ThreadSleeper,
};
use crate::adapters::sysfs_input::{BatteryInput, ButtonInput, SysfsAdc, SysfsButton};
use crate::app::config::{AppConfig, ProvisioningOverrides};
use crate::app::error::AppError;
use crate::app::services::{SessionStore, SqliteSessionStore};
use crate::domain::battery;
use crate::domain::debouncer::{
    ButtonEvent, DebounceSettings, Debouncer, MonotonicClock, RawLevel,
};
use crate::domain::models::{DeviceConfig, DeviceSnapshot, DeviceState, WorkSession};
use crate::domain::session_state::{
    Clock, Effect, RemoteCommand, SessionStateMachine, TimestampMs,
};

pub const BATTERY_CHECK_INTERVAL_MS: i64 = 60_000;
pub const PERSIST_ATTEMPTS: u8 = 3;
pub const PERSIST_BACKOFF_MS: u64 = 100;
pub const POLL_INTERVAL_MS: u64 = 10;
pub const ERROR_DISPLAY_MS: u64 = 2_000;

/// Wall time for session timestamps, plus a monotonic count from process start for
/// button timing.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> TimestampMs {
        TimestampMs(Utc::now().timestamp_millis())
    }
}

impl MonotonicClock for SystemClock {
    fn monotonic_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub project_id: String,
    pub error_display: Duration,
    pub energy_update_interval_ms: u64,
    pub persist_attempts: u8,
    pub persist_backoff: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            project_id: config.project_id.clone(),
            error_display: Duration::from_millis(config.error_display_ms),
            energy_update_interval_ms: config.energy_update_interval_ms,
            persist_attempts: PERSIST_ATTEMPTS,
            persist_backoff: Duration::from_millis(PERSIST_BACKOFF_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    Continue,
    Provisioning,
}

/// Owns the state machine and applies its effects against the device's collaborators.
pub struct DeviceController<A, St, D, C, Sl> {
    api: A,
    store: St,
    display: D,
    clock: C,
    sleeper: Sl,
    machine: SessionStateMachine,
    debouncer: Debouncer,
    settings: ControllerSettings,
    snapshot: SharedSnapshot,
    provisioning_requested: bool,
    battery_percent: Option<u8>,
    last_battery_check: Option<TimestampMs>,
}

impl<A, St, D, C, Sl> DeviceController<A, St, D, C, Sl>
where
    A: SessionApi,
    St: SessionStore,
    D: Display,
    C: Clock + MonotonicClock,
    Sl: Sleeper,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: A,
        store: St,
        display: D,
        clock: C,
        sleeper: Sl,
        device: DeviceConfig,
        settings: ControllerSettings,
        debounce: DebounceSettings,
        snapshot: SharedSnapshot,
    ) -> Self {
        Self {
            api,
            store,
            display,
            clock,
            sleeper,
            machine: SessionStateMachine::new(device, settings.energy_update_interval_ms),
            debouncer: Debouncer::new(debounce),
            settings,
            snapshot,
            provisioning_requested: false,
            battery_percent: None,
            last_battery_check: None,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.machine.state()
    }

    pub fn session(&self) -> &WorkSession {
        self.machine.session()
    }

    pub fn battery_percent(&self) -> Option<u8> {
        self.battery_percent
    }

    pub fn boot(&mut self) -> LoopSignal {
        let effects = self.machine.begin_connecting();
        self.apply(effects);

        if !self.api.is_configured() {
            tracing::warn!("no remote endpoint configured; provisioning required");
            let effects = self.machine.require_provisioning();
            self.apply(effects);
            return self.signal();
        }

        let saved = match self.store.load_session() {
            Ok(saved) => saved,
            Err(error) => {
                tracing::error!(error = %error, "failed to load persisted session");
                None
            }
        };

        let effects = self.machine.boot_completed(saved, &self.clock);
        self.apply(effects);
        let effects = self.machine.tick(&self.clock);
        self.apply(effects);

        self.reconcile_with_server();
        self.signal()
    }

    /// Feeds one raw button sample and runs whatever transition it triggers.
    pub fn on_sample(&mut self, raw: RawLevel) -> LoopSignal {
        let event = self.debouncer.observe(raw, self.clock.monotonic_ms());

        if event != ButtonEvent::None {
            let effects = self.machine.on_button(event);
            self.apply(effects);
        }

        let effects = self.machine.tick(&self.clock);
        if !effects.is_empty() {
            self.apply(effects);
        }

        self.signal()
    }

    pub fn maybe_check_battery<B: BatteryInput>(&mut self, battery: &mut B) {
        let now = self.clock.now();
        if let Some(last) = self.last_battery_check
            && now.0.saturating_sub(last.0) < BATTERY_CHECK_INTERVAL_MS
        {
            return;
        }
        self.last_battery_check = Some(now);

        match battery.read_raw() {
            Ok(raw) => {
                let voltage = battery::voltage_from_raw(raw);
                let percent = battery::percent_from_voltage(voltage);
                if battery::is_low(percent) {
                    tracing::warn!(voltage, percent, "battery low");
                } else {
                    tracing::debug!(voltage, percent, "battery level");
                }
                self.battery_percent = Some(percent);
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to read battery level");
            }
        }
        self.publish();
    }

    fn signal(&self) -> LoopSignal {
        if self.provisioning_requested {
            LoopSignal::Provisioning
        } else {
            LoopSignal::Continue
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue = VecDeque::from(effects);

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::SetBrightness(level) => self.display.set_brightness(level),
                Effect::SetStatus(color) => self.display.set_status(color),
                Effect::Pulse(color) => self.display.pulse(color),
                Effect::EnergyMeter(reading) => {
                    self.display
                        .set_energy_meter(reading.level, reading.resolution, reading.tier);
                }
                Effect::Celebrate => self.display.celebrate(),
                Effect::ClearDisplay => self.display.clear(),
                Effect::PersistSession(session) => self.persist_session(&session),
                Effect::ClearPersistedSession => {
                    if let Err(error) = self.store.clear_session() {
                        tracing::error!(error = %error, "failed to clear persisted session");
                    }
                }
                Effect::Issue(command) => {
                    self.publish();
                    let outcome = match &command {
                        RemoteCommand::ClockIn => self.api.clock_in(&self.settings.project_id),
                        RemoteCommand::ClockOut { session_id } => self.api.clock_out(session_id),
                    };
                    queue.extend(self.machine.on_remote_result(outcome, &self.clock));
                }
                Effect::AwaitErrorDisplay => {
                    self.publish();
                    self.sleeper.sleep(self.settings.error_display);
                    queue.extend(self.machine.resolve_error());
                }
                Effect::EnterProvisioning => {
                    tracing::warn!("entering provisioning mode");
                    self.provisioning_requested = true;
                }
            }
        }

        self.publish();
    }

    fn persist_session(&mut self, session: &WorkSession) {
        let attempts = self.settings.persist_attempts.max(1);
        for attempt in 1..=attempts {
            match self.store.save_session(session) {
                Ok(()) => {
                    tracing::debug!(session_id = %session.session_id, attempt, "session persisted");
                    return;
                }
                Err(error) if attempt < attempts => {
                    tracing::warn!(attempt, error = %error, "session persist failed; retrying");
                    self.sleeper.sleep(self.settings.persist_backoff);
                }
                Err(error) => {
                    tracing::error!(
                        session_id = %session.session_id,
                        attempts,
                        error = %error,
                        "session could not be persisted; keeping it in memory"
                    );
                }
            }
        }
    }

    /// Compares the server's open session with the local one. Local state stays authoritative.
    fn reconcile_with_server(&mut self) {
        let outcome = self.api.get_status();
        if !outcome.success {
            tracing::warn!(
                error = %outcome.error_message(),
                "could not fetch server session status"
            );
            return;
        }

        let local = self
            .machine
            .session()
            .is_active()
            .then(|| self.machine.session().session_id.clone());

        if outcome.session_id != local {
            tracing::warn!(
                local_session = ?local,
                server_session = ?outcome.session_id,
                server_started_at = ?outcome.started_at,
                "server session differs from local session"
            );
        } else {
            tracing::info!(session = ?local, "server session matches local state");
        }
    }

    fn publish(&self) {
        let context = self.machine.context();
        let updated_at = chrono::DateTime::<Utc>::from_timestamp_millis(self.clock.now().0)
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true));

        let mut snapshot = match self.snapshot.lock() {
            Ok(snapshot) => snapshot,
            Err(poisoned) => poisoned.into_inner(),
        };
        snapshot.state = context.state;
        snapshot.session = context
            .session
            .is_active()
            .then(|| context.session.clone());
        snapshot.last_error = self.machine.last_error().map(ToString::to_string);
        snapshot.battery_percent = self.battery_percent;
        snapshot.remote_configured = self.api.is_configured();
        snapshot.updated_at = updated_at;
    }
}

pub fn start_control_loop<A, St, D, C, Sl, B, Bt>(
    mut controller: DeviceController<A, St, D, C, Sl>,
    mut button: B,
    mut battery: Option<Bt>,
    poll_interval: Duration,
    stop_flag: Arc<AtomicBool>,
    provisioning_flag: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>>
where
    A: SessionApi + Send + 'static,
    St: SessionStore + Send + 'static,
    D: Display + Send + 'static,
    C: Clock + MonotonicClock + Send + 'static,
    Sl: Sleeper + Send + 'static,
    B: ButtonInput + Send + 'static,
    Bt: BatteryInput + Send + 'static,
{
    std::thread::Builder::new()
        .name("control-loop".to_string())
        .spawn(move || {
            if controller.boot() == LoopSignal::Provisioning {
                provisioning_flag.store(true, Ordering::Relaxed);
                return;
            }

            let mut input_failing = false;
            while !stop_flag.load(Ordering::Relaxed) {
                match button.read_level() {
                    Ok(level) => {
                        if input_failing {
                            tracing::info!("button input recovered");
                            input_failing = false;
                        }
                        if controller.on_sample(level) == LoopSignal::Provisioning {
                            provisioning_flag.store(true, Ordering::Relaxed);
                            break;
                        }
                    }
                    Err(error) => {
                        if !input_failing {
                            tracing::warn!(error = %error, "failed to read button input");
                            input_failing = true;
                        }
                    }
                }

                if let Some(battery) = battery.as_mut() {
                    controller.maybe_check_battery(battery);
                }

                std::thread::sleep(poll_interval);
            }

            tracing::info!(state = ?controller.state(), "control loop stopped");
        })
}

/// Applies provisioned fields over the stored device configuration.
pub fn provision_device_config<St: SessionStore>(
    store: &St,
    overrides: &ProvisioningOverrides,
) -> Result<DeviceConfig, AppError> {
    let mut device = store.load_config().map_err(AppError::database_init)?;
    if overrides.is_empty() {
        return Ok(device);
    }

    if let Some(endpoint) = &overrides.api_endpoint {
        device.api_endpoint = endpoint.clone();
    }
    if let Some(token) = &overrides.api_token {
        device.api_token = token.clone();
    }
    if let Some(hours) = overrides.work_hours {
        device.work_hours = hours;
    }
    if let Some(brightness) = overrides.led_brightness {
        device.brightness = brightness;
    }

    store.save_config(&device).map_err(AppError::database_init)?;
    tracing::info!(
        api_endpoint = %device.api_endpoint,
        work_hours = device.work_hours,
        brightness = device.brightness,
        "stored provisioned device configuration"
    );
    Ok(device)
}

fn open_store(config: &AppConfig) -> Result<SqliteSessionStore, AppError> {
    let mut connection =
        crate::adapters::db::open_connection(&config.db_path).map_err(AppError::database_init)?;
    crate::adapters::db::run_migrations(&mut connection).map_err(AppError::database_init)?;
    Ok(SqliteSessionStore::new(Arc::new(Mutex::new(connection))))
}

fn build_client(
    config: &AppConfig,
    device: &DeviceConfig,
) -> Result<RemoteSessionClient<ReqwestTransport, ThreadSleeper>, AppError> {
    let transport = ReqwestTransport::new().map_err(AppError::runtime)?;
    let policy = RetryPolicy {
        attempts: config.api_retry_count,
        timeout: Duration::from_millis(config.api_timeout_ms),
        backoff_base: Duration::from_millis(config.api_backoff_base_ms),
    };
    Ok(RemoteSessionClient::new(
        transport,
        ThreadSleeper,
        &device.api_endpoint,
        &device.api_token,
        policy,
    ))
}

pub fn run_device(config: AppConfig) -> Result<(), AppError> {
    let button_path = config.require_button_input()?.to_string();
    let store = open_store(&config)?;
    let device = provision_device_config(&store, &config.provisioning)?;

    let snapshot: SharedSnapshot = Arc::new(Mutex::new(DeviceSnapshot::default()));
    let client = build_client(&config, &device)?;

    let active_level = if config.button_active_low {
        RawLevel::Low
    } else {
        RawLevel::High
    };
    let controller = DeviceController::new(
        client,
        store.clone(),
        FrameDisplay::new(Arc::clone(&snapshot)),
        SystemClock::new(),
        ThreadSleeper,
        device,
        ControllerSettings::from_config(&config),
        DebounceSettings {
            debounce_ms: config.debounce_ms,
            long_press_ms: config.long_press_ms,
            active_level,
        },
        Arc::clone(&snapshot),
    );

    let stop_flag = Arc::new(AtomicBool::new(false));
    let provisioning_flag = Arc::new(AtomicBool::new(false));
    let control_handle = start_control_loop(
        controller,
        SysfsButton::new(button_path),
        config.battery_adc_path.as_deref().map(SysfsAdc::new),
        Duration::from_millis(config.poll_interval_ms),
        Arc::clone(&stop_flag),
        Arc::clone(&provisioning_flag),
    )
    .map_err(AppError::runtime)?;

    let server_result = match config.http_bind.clone() {
        Some(bind) => {
            let result = serve_diagnostics(
                &bind,
                ApiState {
                    snapshot: Arc::clone(&snapshot),
                    store,
                },
                Arc::clone(&provisioning_flag),
            );
            stop_flag.store(true, Ordering::Relaxed);
            result
        }
        None => {
            tracing::info!("diagnostics api disabled; running control loop only");
            Ok(())
        }
    };

    if control_handle.join().is_err() {
        return Err(AppError::runtime("control loop thread panicked"));
    }

    if provisioning_flag.load(Ordering::Relaxed) {
        tracing::warn!("device is in provisioning mode; restart after configuring");
    }

    server_result.map_err(AppError::runtime)
}

fn serve_diagnostics(
    bind: &str,
    api_state: ApiState,
    provisioning_flag: Arc<AtomicBool>,
) -> std::io::Result<()> {
    tracing::info!(bind = %bind, "http server starting");

    actix_web::rt::System::new().block_on(async move {
        let server = HttpServer::new(move || {
            App::new()
                .wrap(cors())
                .app_data(web::Data::new(api_state.clone()))
                .configure(configure_routes)
        })
        .bind(bind)?
        .run();

        let handle = server.handle();
        actix_web::rt::spawn(async move {
            while !provisioning_flag.load(Ordering::Relaxed) {
                actix_web::rt::time::sleep(Duration::from_millis(250)).await;
            }
            tracing::info!("stopping http server for provisioning");
            handle.stop(true).await;
        });

        server.await
    })
}

pub fn run_probe(config: AppConfig) -> Result<(), AppError> {
    let store = open_store(&config)?;
    let mut device = store.load_config().map_err(AppError::database_init)?;
    if let Some(endpoint) = &config.provisioning.api_endpoint {
        device.api_endpoint = endpoint.clone();
    }
    if let Some(token) = &config.provisioning.api_token {
        device.api_token = token.clone();
    }

    let local = store.load_session().map_err(AppError::database_init)?;
    let client = build_client(&config, &device)?;
    let outcome = client.get_status();

    println!("endpoint: {}", device.api_endpoint);
    println!(
        "local session: {}",
        local.as_ref().map_or("none", |session| session.session_id.as_str())
    );
    println!("attempts: {}", outcome.attempts);
    if let Some(status) = outcome.status_code {
        println!("http status: {status}");
    }

    if !outcome.success {
        return Err(AppError::runtime(outcome.error_message()));
    }

    println!(
        "server session: {}",
        outcome.session_id.as_deref().unwrap_or("none")
    );
    if let Some(started_at) = outcome
        .started_at
        .and_then(|at| chrono::DateTime::<Utc>::from_timestamp(at, 0))
    {
        println!(
            "server started at: {}",
            started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::{Arc, Mutex, mpsc};
    use std::time::Duration;

    use crate::adapters::db;
    use crate::adapters::display::{Display, FrameDisplay, SharedSnapshot};
    use crate::adapters::remote_session::{SessionApi, Sleeper};
    use crate::adapters::sysfs_input::{BatteryInput, InputError};
    use crate::app::config::{AppConfig, ProvisioningOverrides};
    use crate::app::services::{SessionStore, SqliteSessionStore, StoreError};
    use crate::domain::debouncer::{DebounceSettings, MonotonicClock, RawLevel};
    use crate::domain::energy::EnergyTier;
    use crate::domain::models::{
        DeviceConfig, DeviceSnapshot, DeviceState, RemoteCallError, RemoteCallOutcome,
        StatusColor, WorkSession,
    };
    use crate::test_support::{TemplateKind, temp_db_from_template};

    use super::{
        Clock, ControllerSettings, DeviceController, LoopSignal, TimestampMs,
        provision_device_config, run_device,
    };

    const T0: i64 = 1_771_574_400_000;

    /// `advance` moves both time sources; `step_wall` only moves wall time.
    #[derive(Clone)]
    struct FakeClock {
        now: Arc<AtomicI64>,
        wall_offset: Arc<AtomicI64>,
    }

    impl FakeClock {
        fn at(ms: i64) -> Self {
            Self {
                now: Arc::new(AtomicI64::new(ms)),
                wall_offset: Arc::default(),
            }
        }

        fn advance(&self, ms: i64) {
            self.now.fetch_add(ms, Ordering::SeqCst);
        }

        fn step_wall(&self, ms: i64) {
            self.wall_offset.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> TimestampMs {
            TimestampMs(self.now.load(Ordering::SeqCst) + self.wall_offset.load(Ordering::SeqCst))
        }
    }

    impl MonotonicClock for FakeClock {
        fn monotonic_ms(&self) -> u64 {
            u64::try_from(self.now.load(Ordering::SeqCst)).unwrap_or(0)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        ClockIn(String),
        ClockOut(String),
        Status,
    }

    #[derive(Clone, Default)]
    struct ScriptedApi {
        configured: bool,
        outcomes: Arc<Mutex<VecDeque<RemoteCallOutcome>>>,
        calls: Arc<Mutex<Vec<Call>>>,
        latency: Option<(FakeClock, i64)>,
    }

    impl ScriptedApi {
        fn configured(outcomes: Vec<RemoteCallOutcome>) -> Self {
            Self {
                configured: true,
                outcomes: Arc::new(Mutex::new(outcomes.into())),
                ..Self::default()
            }
        }

        /// Every call lets `ms` pass on `clock` before answering.
        fn taking(mut self, clock: &FakeClock, ms: i64) -> Self {
            self.latency = Some((clock.clone(), ms));
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().expect("lock").clone()
        }

        fn next(&self, call: Call) -> RemoteCallOutcome {
            self.calls.lock().expect("lock").push(call);
            if let Some((clock, ms)) = &self.latency {
                clock.advance(*ms);
            }
            self.outcomes
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| {
                    RemoteCallOutcome::failed(
                        RemoteCallError::Transport("request timed out".to_string()),
                        None,
                        3,
                    )
                })
        }
    }

    impl SessionApi for ScriptedApi {
        fn is_configured(&self) -> bool {
            self.configured
        }

        fn clock_in(&self, project_id: &str) -> RemoteCallOutcome {
            self.next(Call::ClockIn(project_id.to_string()))
        }

        fn clock_out(&self, session_id: &str) -> RemoteCallOutcome {
            self.next(Call::ClockOut(session_id.to_string()))
        }

        fn get_status(&self) -> RemoteCallOutcome {
            self.next(Call::Status)
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Shown {
        Status(StatusColor),
        Meter(u8, EnergyTier),
        Pulse(StatusColor),
        Celebrate,
        Clear,
        Brightness(u8),
    }

    /// Records commands in order and forwards them to a frame display.
    #[derive(Clone)]
    struct RecordingDisplay {
        shown: Arc<Mutex<Vec<Shown>>>,
        inner: FrameDisplay,
    }

    impl RecordingDisplay {
        fn new(snapshot: SharedSnapshot) -> Self {
            Self {
                shown: Arc::default(),
                inner: FrameDisplay::new(snapshot),
            }
        }

        fn take(&self) -> Vec<Shown> {
            std::mem::take(&mut *self.shown.lock().expect("lock"))
        }

        fn record(&self, shown: Shown) {
            self.shown.lock().expect("lock").push(shown);
        }
    }

    impl Display for RecordingDisplay {
        fn set_status(&mut self, color: StatusColor) {
            self.record(Shown::Status(color));
            self.inner.set_status(color);
        }

        fn set_energy_meter(&mut self, level: u8, resolution: u8, tier: EnergyTier) {
            self.record(Shown::Meter(level, tier));
            self.inner.set_energy_meter(level, resolution, tier);
        }

        fn pulse(&mut self, color: StatusColor) {
            self.record(Shown::Pulse(color));
            self.inner.pulse(color);
        }

        fn celebrate(&mut self) {
            self.record(Shown::Celebrate);
            self.inner.celebrate();
        }

        fn clear(&mut self) {
            self.record(Shown::Clear);
            self.inner.clear();
        }

        fn set_brightness(&mut self, level: u8) {
            self.record(Shown::Brightness(level));
            self.inner.set_brightness(level);
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSleeper {
        slept: Arc<Mutex<Vec<Duration>>>,
        clock: Option<FakeClock>,
    }

    impl RecordingSleeper {
        fn advancing(clock: &FakeClock) -> Self {
            Self {
                clock: Some(clock.clone()),
                ..Self::default()
            }
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.slept.lock().expect("lock").push(duration);
            if let Some(clock) = &self.clock {
                clock.advance(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX));
            }
        }
    }

    /// Fails the first `failures` session writes, then delegates.
    #[derive(Clone)]
    struct FlakyStore {
        inner: SqliteSessionStore,
        failures: Arc<Mutex<u8>>,
    }

    impl SessionStore for FlakyStore {
        fn save_session(&self, session: &WorkSession) -> Result<(), StoreError> {
            let mut failures = self.failures.lock().expect("lock");
            if *failures > 0 {
                *failures -= 1;
                return Err(StoreError::DbLockPoisoned);
            }
            self.inner.save_session(session)
        }

        fn clear_session(&self) -> Result<(), StoreError> {
            self.inner.clear_session()
        }

        fn load_session(&self) -> Result<Option<WorkSession>, StoreError> {
            self.inner.load_session()
        }

        fn save_config(&self, config: &DeviceConfig) -> Result<(), StoreError> {
            self.inner.save_config(config)
        }

        fn load_config(&self) -> Result<DeviceConfig, StoreError> {
            self.inner.load_config()
        }
    }

    struct FixedAdc(Result<u16, ()>);

    impl BatteryInput for FixedAdc {
        fn read_raw(&mut self) -> Result<u16, InputError> {
            self.0.map_err(|_| InputError::InvalidValue {
                path: "adc".to_string(),
                value: "?".to_string(),
            })
        }
    }

    fn sqlite_store(kind: TemplateKind) -> SqliteSessionStore {
        let path = temp_db_from_template(kind);
        let connection =
            db::open_connection(path.to_string_lossy().as_ref()).expect("db connection should open");
        SqliteSessionStore::new(Arc::new(Mutex::new(connection)))
    }

    fn settings() -> ControllerSettings {
        ControllerSettings {
            project_id: "office-time".to_string(),
            error_display: Duration::from_millis(2000),
            energy_update_interval_ms: 300_000,
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(100),
        }
    }

    fn device_config() -> DeviceConfig {
        DeviceConfig {
            api_endpoint: "https://time.test".to_string(),
            ..DeviceConfig::default()
        }
    }

    struct Rig<St> {
        controller: DeviceController<ScriptedApi, St, RecordingDisplay, FakeClock, RecordingSleeper>,
        api: ScriptedApi,
        display: RecordingDisplay,
        clock: FakeClock,
        sleeper: RecordingSleeper,
        snapshot: SharedSnapshot,
    }

    fn build_rig<St: SessionStore>(api: ScriptedApi, store: St) -> Rig<St> {
        build_rig_on(api, store, FakeClock::at(T0), RecordingSleeper::default())
    }

    fn build_rig_on<St: SessionStore>(
        api: ScriptedApi,
        store: St,
        clock: FakeClock,
        sleeper: RecordingSleeper,
    ) -> Rig<St> {
        let snapshot: SharedSnapshot = Arc::new(Mutex::new(DeviceSnapshot::default()));
        let display = RecordingDisplay::new(Arc::clone(&snapshot));
        let controller = DeviceController::new(
            api.clone(),
            store,
            display.clone(),
            clock.clone(),
            sleeper.clone(),
            device_config(),
            settings(),
            DebounceSettings::default(),
            Arc::clone(&snapshot),
        );

        Rig {
            controller,
            api,
            display,
            clock,
            sleeper,
            snapshot,
        }
    }

    impl<St: SessionStore> Rig<St> {
        /// Clean press and release (active low), 200 ms hold.
        fn click(&mut self) {
            for (level, step) in [
                (RawLevel::Low, 0),
                (RawLevel::Low, 60),
                (RawLevel::Low, 140),
                (RawLevel::High, 0),
                (RawLevel::High, 60),
            ] {
                self.clock.advance(step);
                assert_eq!(self.controller.on_sample(level), LoopSignal::Continue);
            }
        }

        /// Short press whose release is first sampled after whatever the press triggered.
        fn tap(&mut self) {
            for (level, step) in [
                (RawLevel::Low, 0),
                (RawLevel::Low, 60),
                (RawLevel::High, 10),
                (RawLevel::High, 60),
            ] {
                self.clock.advance(step);
                assert_eq!(self.controller.on_sample(level), LoopSignal::Continue);
            }
        }
    }

    fn ok_with_session(session_id: &str) -> RemoteCallOutcome {
        RemoteCallOutcome {
            success: true,
            status_code: Some(200),
            session_id: Some(session_id.to_string()),
            attempts: 1,
            ..RemoteCallOutcome::default()
        }
    }

    fn ok_empty() -> RemoteCallOutcome {
        RemoteCallOutcome {
            success: true,
            status_code: Some(200),
            attempts: 1,
            ..RemoteCallOutcome::default()
        }
    }

    #[test]
    fn clock_in_and_out_persists_and_clears_session() {
        let store = sqlite_store(TemplateKind::Empty);
        let api = ScriptedApi::configured(vec![
            ok_empty(),
            ok_with_session("b1"),
            ok_empty(),
        ]);
        let mut rig = build_rig(api, store.clone());

        assert_eq!(rig.controller.boot(), LoopSignal::Continue);
        assert_eq!(rig.controller.state(), DeviceState::IdleClockedOut);
        assert_eq!(
            rig.display.take(),
            vec![
                Shown::Brightness(128),
                Shown::Status(StatusColor::Blue),
                Shown::Status(StatusColor::Red),
            ]
        );

        rig.click();

        assert_eq!(rig.controller.state(), DeviceState::WorkingClockedIn);
        let persisted = store
            .load_session()
            .expect("load should succeed")
            .expect("session should be persisted");
        assert_eq!(persisted.session_id, "b1");
        assert_eq!(persisted.start_time, (T0 + 60) / 1000);
        assert_eq!(
            rig.display.take(),
            vec![
                Shown::Pulse(StatusColor::Blue),
                Shown::Status(StatusColor::Green),
                Shown::Meter(7, EnergyTier::Full),
            ]
        );

        rig.clock.advance(2 * 3600 * 1000);
        rig.click();

        assert_eq!(rig.controller.state(), DeviceState::IdleClockedOut);
        assert_eq!(store.load_session().expect("load should succeed"), None);
        let shown = rig.display.take();
        assert!(!shown.contains(&Shown::Celebrate));
        assert_eq!(shown.last(), Some(&Shown::Status(StatusColor::Red)));

        assert_eq!(
            rig.api.calls(),
            vec![
                Call::Status,
                Call::ClockIn("office-time".to_string()),
                Call::ClockOut("b1".to_string()),
            ]
        );
        let snapshot = rig.snapshot.lock().expect("lock").clone();
        assert_eq!(snapshot.state, DeviceState::IdleClockedOut);
        assert_eq!(snapshot.session, None);
        assert_eq!(snapshot.display.status, StatusColor::Red);
    }

    #[test]
    fn full_work_day_celebrates_before_clearing() {
        let store = sqlite_store(TemplateKind::Empty);
        let api = ScriptedApi::configured(vec![ok_empty(), ok_with_session("b2"), ok_empty()]);
        let mut rig = build_rig(api, store);

        rig.controller.boot();
        rig.click();
        rig.display.take();

        rig.clock.advance(8 * 3600 * 1000);
        rig.click();

        let shown: Vec<Shown> = rig
            .display
            .take()
            .into_iter()
            .filter(|shown| !matches!(shown, Shown::Meter(..)))
            .collect();
        assert_eq!(
            shown,
            vec![
                Shown::Pulse(StatusColor::Blue),
                Shown::Celebrate,
                Shown::Clear,
                Shown::Status(StatusColor::Red),
            ]
        );
        assert_eq!(rig.snapshot.lock().expect("lock").display.celebrations, 1);
    }

    #[test]
    fn failed_clock_out_keeps_session_after_error_display() {
        let store = sqlite_store(TemplateKind::Provisioned);
        let api = ScriptedApi::configured(vec![
            ok_with_session("b0"),
            RemoteCallOutcome::failed(RemoteCallError::Protocol { status: 500 }, Some(500), 3),
        ]);
        let mut rig = build_rig(api, store.clone());

        rig.controller.boot();
        assert_eq!(rig.controller.state(), DeviceState::WorkingClockedIn);
        rig.display.take();

        rig.click();

        assert_eq!(rig.controller.state(), DeviceState::WorkingClockedIn);
        assert_eq!(rig.controller.session().session_id, "b0");
        assert_eq!(
            store
                .load_session()
                .expect("load should succeed")
                .map(|session| session.session_id),
            Some("b0".to_string())
        );
        assert_eq!(
            rig.display.take(),
            vec![
                Shown::Pulse(StatusColor::Blue),
                Shown::Pulse(StatusColor::Yellow),
                Shown::Status(StatusColor::Green),
            ]
        );
        assert_eq!(
            *rig.sleeper.slept.lock().expect("lock"),
            vec![Duration::from_millis(2000)]
        );
        assert_eq!(
            rig.snapshot.lock().expect("lock").last_error.as_deref(),
            Some("server responded with HTTP 500")
        );
    }

    #[test]
    fn failed_clock_in_returns_to_idle() {
        let store = sqlite_store(TemplateKind::Empty);
        let api = ScriptedApi::configured(vec![ok_empty()]);
        let mut rig = build_rig(api, store.clone());

        rig.controller.boot();
        rig.display.take();
        rig.click();

        assert_eq!(rig.controller.state(), DeviceState::IdleClockedOut);
        assert_eq!(store.load_session().expect("load should succeed"), None);
        assert_eq!(
            rig.display.take(),
            vec![
                Shown::Pulse(StatusColor::Blue),
                Shown::Pulse(StatusColor::Yellow),
                Shown::Status(StatusColor::Red),
            ]
        );
    }

    #[test]
    fn restored_session_refreshes_energy_at_boot() {
        let store = sqlite_store(TemplateKind::Provisioned);
        let api = ScriptedApi::configured(vec![ok_with_session("other")]);
        let mut rig = build_rig(api, store);

        rig.clock.advance(3 * 3600 * 1000);
        assert_eq!(rig.controller.boot(), LoopSignal::Continue);

        assert_eq!(rig.controller.state(), DeviceState::WorkingClockedIn);
        assert_eq!(
            rig.display.take(),
            vec![
                Shown::Brightness(128),
                Shown::Status(StatusColor::Blue),
                Shown::Status(StatusColor::Green),
                Shown::Meter(4, EnergyTier::Full),
            ]
        );
        assert_eq!(rig.api.calls(), vec![Call::Status]);
    }

    #[test]
    fn unconfigured_device_enters_provisioning_at_boot() {
        let store = sqlite_store(TemplateKind::Empty);
        let mut rig = build_rig(ScriptedApi::default(), store);

        assert_eq!(rig.controller.boot(), LoopSignal::Provisioning);
        assert_eq!(rig.controller.state(), DeviceState::ConfigMode);
        assert!(rig.api.calls().is_empty());
        assert_eq!(
            rig.display.take().last(),
            Some(&Shown::Status(StatusColor::White))
        );
    }

    #[test]
    fn long_press_requests_provisioning() {
        let store = sqlite_store(TemplateKind::Empty);
        let api = ScriptedApi::configured(vec![ok_empty(), ok_with_session("b3")]);
        let mut rig = build_rig(api, store);
        rig.controller.boot();

        assert_eq!(rig.controller.on_sample(RawLevel::Low), LoopSignal::Continue);
        rig.clock.advance(60);
        assert_eq!(rig.controller.on_sample(RawLevel::Low), LoopSignal::Continue);
        assert_eq!(rig.controller.state(), DeviceState::WorkingClockedIn);

        rig.clock.advance(3000);
        assert_eq!(
            rig.controller.on_sample(RawLevel::Low),
            LoopSignal::Provisioning
        );
        assert_eq!(rig.controller.state(), DeviceState::ConfigMode);
    }

    #[test]
    fn persist_failure_is_retried_then_kept_in_memory() {
        let flaky = FlakyStore {
            inner: sqlite_store(TemplateKind::Empty),
            failures: Arc::new(Mutex::new(2)),
        };
        let api = ScriptedApi::configured(vec![ok_empty(), ok_with_session("b4")]);
        let mut rig = build_rig(api, flaky.clone());
        rig.controller.boot();
        rig.click();

        assert_eq!(
            flaky
                .load_session()
                .expect("load should succeed")
                .map(|session| session.session_id),
            Some("b4".to_string())
        );
        assert_eq!(
            *rig.sleeper.slept.lock().expect("lock"),
            vec![Duration::from_millis(100), Duration::from_millis(100)]
        );

        let always_failing = FlakyStore {
            inner: sqlite_store(TemplateKind::Empty),
            failures: Arc::new(Mutex::new(u8::MAX)),
        };
        let api = ScriptedApi::configured(vec![ok_empty(), ok_with_session("b5")]);
        let mut rig = build_rig(api, always_failing.clone());
        rig.controller.boot();
        rig.click();

        assert_eq!(rig.controller.state(), DeviceState::WorkingClockedIn);
        assert_eq!(rig.controller.session().session_id, "b5");
        assert_eq!(always_failing.load_session().expect("load should succeed"), None);
    }

    #[test]
    fn battery_is_sampled_at_most_once_per_minute() {
        let store = sqlite_store(TemplateKind::Empty);
        let mut rig = build_rig(ScriptedApi::configured(vec![ok_empty()]), store);
        rig.controller.boot();

        rig.controller.maybe_check_battery(&mut FixedAdc(Ok(2240)));
        assert_eq!(rig.controller.battery_percent(), Some(50));

        rig.clock.advance(30_000);
        rig.controller.maybe_check_battery(&mut FixedAdc(Ok(1900)));
        assert_eq!(rig.controller.battery_percent(), Some(50));

        rig.clock.advance(30_000);
        rig.controller.maybe_check_battery(&mut FixedAdc(Ok(1900)));
        assert_eq!(rig.controller.battery_percent(), Some(5));

        rig.clock.advance(60_000);
        rig.controller.maybe_check_battery(&mut FixedAdc(Err(())));
        assert_eq!(rig.controller.battery_percent(), Some(5));
        assert_eq!(rig.snapshot.lock().expect("lock").battery_percent, Some(5));
    }

    #[test]
    fn provisioning_overrides_are_stored() {
        let store = sqlite_store(TemplateKind::Provisioned);
        let overrides = ProvisioningOverrides {
            api_endpoint: Some("https://new.test".to_string()),
            work_hours: Some(9),
            ..ProvisioningOverrides::default()
        };

        let device = provision_device_config(&store, &overrides).expect("provisioning works");

        assert_eq!(device.api_endpoint, "https://new.test");
        assert_eq!(device.work_hours, 9);
        assert_eq!(device.api_token, "template-token");
        assert_eq!(device.brightness, 64);
        assert_eq!(store.load_config().expect("load should succeed"), device);

        let untouched = provision_device_config(&store, &ProvisioningOverrides::default())
            .expect("provisioning works");
        assert_eq!(untouched, device);
    }

    #[test]
    fn short_press_around_slow_clock_in_stays_working() {
        let clock = FakeClock::at(T0);
        let api = ScriptedApi::configured(vec![ok_empty(), ok_with_session("b6")])
            .taking(&clock, 3_500);
        let mut rig = build_rig_on(
            api,
            sqlite_store(TemplateKind::Empty),
            clock,
            RecordingSleeper::default(),
        );
        rig.controller.boot();

        rig.tap();

        assert_eq!(rig.controller.state(), DeviceState::WorkingClockedIn);
        assert_eq!(rig.controller.session().session_id, "b6");
    }

    #[test]
    fn slow_failed_clock_in_with_error_display_returns_to_idle() {
        let clock = FakeClock::at(T0);
        let api = ScriptedApi::configured(vec![
            ok_empty(),
            RemoteCallOutcome::failed(
                RemoteCallError::Transport("connection refused".to_string()),
                None,
                3,
            ),
        ])
        .taking(&clock, 3_000);
        let sleeper = RecordingSleeper::advancing(&clock);
        let mut rig = build_rig_on(api, sqlite_store(TemplateKind::Empty), clock, sleeper);
        rig.controller.boot();
        rig.display.take();

        rig.tap();

        assert_eq!(rig.controller.state(), DeviceState::IdleClockedOut);
        assert_eq!(
            *rig.sleeper.slept.lock().expect("lock"),
            vec![Duration::from_millis(2000)]
        );
        assert_eq!(
            rig.display.take(),
            vec![
                Shown::Pulse(StatusColor::Blue),
                Shown::Pulse(StatusColor::Yellow),
                Shown::Status(StatusColor::Red),
            ]
        );
    }

    #[test]
    fn wall_clock_step_does_not_shorten_hold() {
        let store = sqlite_store(TemplateKind::Empty);
        let api = ScriptedApi::configured(vec![ok_empty(), ok_with_session("b7")]);
        let mut rig = build_rig(api, store);
        rig.controller.boot();

        assert_eq!(rig.controller.on_sample(RawLevel::Low), LoopSignal::Continue);
        rig.clock.advance(60);
        assert_eq!(rig.controller.on_sample(RawLevel::Low), LoopSignal::Continue);
        assert_eq!(rig.controller.state(), DeviceState::WorkingClockedIn);

        rig.clock.step_wall(3600 * 1000);
        rig.clock.advance(10);
        assert_eq!(rig.controller.on_sample(RawLevel::Low), LoopSignal::Continue);
        assert_eq!(rig.controller.state(), DeviceState::WorkingClockedIn);

        rig.clock.advance(3000);
        assert_eq!(
            rig.controller.on_sample(RawLevel::Low),
            LoopSignal::Provisioning
        );
    }

    #[test]
    fn device_without_diagnostics_api_keeps_servicing_button() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let button_path = dir.path().join("button");
        let db_path = dir.path().join("device.sqlite");
        std::fs::write(&button_path, "1\n").expect("button file should be written");

        let button = button_path.to_string_lossy().into_owned();
        let db_file = db_path.to_string_lossy().into_owned();
        let config = AppConfig::from_lookup(|key| match key {
            "HTTP_BIND" => Some(String::new()),
            "DB_PATH" => Some(db_file.clone()),
            "BUTTON_INPUT_PATH" => Some(button.clone()),
            "API_ENDPOINT" => Some("http://127.0.0.1:1".to_string()),
            "API_RETRY_COUNT" => Some("1".to_string()),
            "API_TIMEOUT_MS" => Some("500".to_string()),
            "POLL_INTERVAL_MS" => Some("5".to_string()),
            "DEBOUNCE_MS" => Some("10".to_string()),
            "LONG_PRESS_MS" => Some("300".to_string()),
            "ERROR_DISPLAY_MS" => Some("10".to_string()),
            _ => None,
        })
        .expect("config should be valid");
        assert_eq!(config.http_bind, None);

        let (sender, receiver) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = sender.send(run_device(config));
        });

        assert!(matches!(
            receiver.recv_timeout(Duration::from_millis(500)),
            Err(mpsc::RecvTimeoutError::Timeout)
        ));

        // Holding the button past the long-press threshold requests provisioning,
        // which is the only way the loop ends without an http server.
        std::fs::write(&button_path, "0\n").expect("button file should be written");

        assert!(matches!(
            receiver.recv_timeout(Duration::from_secs(10)),
            Ok(Ok(()))
        ));
    }
}
