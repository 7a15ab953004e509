pub const DEFAULT_DEBOUNCE_MS: u64 = 50;
pub const DEFAULT_LONG_PRESS_MS: u64 = 3000;

/// Milliseconds from a source that never steps backwards. Wall-clock corrections must not
/// reach the debouncer.
pub trait MonotonicClock {
    fn monotonic_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawLevel {
    Low,
    High,
}

impl RawLevel {
    pub fn inverted(self) -> Self {
        match self {
            RawLevel::Low => RawLevel::High,
            RawLevel::High => RawLevel::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    None,
    Pressed,
    Released,
    LongPress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceSettings {
    pub debounce_ms: u64,
    pub long_press_ms: u64,
    /// Level read while the button is held. Pull-up wiring makes this `Low`.
    pub active_level: RawLevel,
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            long_press_ms: DEFAULT_LONG_PRESS_MS,
            active_level: RawLevel::Low,
        }
    }
}

/// Where the current physical hold is. `LongPressed` persists until the stable release
/// so the trailing `Released` of that hold is swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldPhase {
    Idle,
    Held { pressed_at_ms: u64 },
    LongPressed,
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    settings: DebounceSettings,
    last_raw: RawLevel,
    stable: RawLevel,
    last_change_ms: u64,
    phase: HoldPhase,
}

impl Debouncer {
    pub fn new(settings: DebounceSettings) -> Self {
        let released = settings.active_level.inverted();
        Self {
            settings,
            last_raw: released,
            stable: released,
            last_change_ms: 0,
            phase: HoldPhase::Idle,
        }
    }

    pub fn is_held(&self) -> bool {
        self.stable == self.settings.active_level
    }

    pub fn observe(&mut self, raw: RawLevel, now_ms: u64) -> ButtonEvent {
        if raw != self.last_raw {
            self.last_raw = raw;
            self.last_change_ms = now_ms;
        }

        let mut event = ButtonEvent::None;

        if raw != self.stable
            && now_ms.saturating_sub(self.last_change_ms) >= self.settings.debounce_ms
        {
            self.stable = raw;

            if raw == self.settings.active_level {
                self.phase = HoldPhase::Held {
                    pressed_at_ms: self.last_change_ms,
                };
                tracing::debug!(pressed_at_ms = self.last_change_ms, "button pressed");
                event = ButtonEvent::Pressed;
            } else {
                let finished = std::mem::replace(&mut self.phase, HoldPhase::Idle);
                if finished != HoldPhase::LongPressed {
                    tracing::debug!(released_at_ms = self.last_change_ms, "button released");
                    event = ButtonEvent::Released;
                }
            }
        }

        // A press accepted on this very sample reports its long press on the next one.
        // Only a sample that still reads held can complete a long press.
        if event == ButtonEvent::None
            && raw == self.settings.active_level
            && let HoldPhase::Held { pressed_at_ms } = self.phase
            && now_ms.saturating_sub(pressed_at_ms) >= self.settings.long_press_ms
        {
            self.phase = HoldPhase::LongPressed;
            tracing::info!(
                held_ms = now_ms.saturating_sub(pressed_at_ms),
                "button long press detected"
            );
            event = ButtonEvent::LongPress;
        }

        event
    }
}
