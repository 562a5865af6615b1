use serde::{Deserialize, Serialize};

use crate::time_of_day::{TimeOfDay, MINUTES_PER_DAY};

pub const MAX_DUTY: u8 = u8::MAX;
pub const DEFAULT_RAMP_MINUTES: u16 = 60;

/// Daily on/off schedule. `ramp_duration_minutes` is a deployment constant and
/// is never read from or written to the settings record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(rename = "onTime", alias = "horaLigar")]
    pub on_time: TimeOfDay,
    #[serde(rename = "offTime", alias = "horaDesligar")]
    pub off_time: TimeOfDay,
    #[serde(skip, default = "default_ramp_minutes")]
    pub ramp_duration_minutes: u16,
    #[serde(rename = "maxIntensityPercent", alias = "luzMaxima")]
    pub max_intensity_percent: u8,
}

fn default_ramp_minutes() -> u16 {
    DEFAULT_RAMP_MINUTES
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            on_time: TimeOfDay::from_minutes(8 * 60).unwrap_or(TimeOfDay::MIDNIGHT),
            off_time: TimeOfDay::from_minutes(18 * 60).unwrap_or(TimeOfDay::MIDNIGHT),
            ramp_duration_minutes: DEFAULT_RAMP_MINUTES,
            max_intensity_percent: 80,
        }
    }
}

impl ScheduleConfig {
    pub fn with_ramp(mut self, minutes: u16) -> Self {
        self.ramp_duration_minutes = minutes;
        self.sanitize();
        self
    }

    pub fn sanitize(&mut self) {
        self.max_intensity_percent = self.max_intensity_percent.min(100);
        self.ramp_duration_minutes = self.ramp_duration_minutes.min(MINUTES_PER_DAY - 1);
    }

    /// Percent mapped onto the 8-bit duty range, rounded half up.
    pub fn max_duty(&self) -> u8 {
        let percent = u32::from(self.max_intensity_percent.min(100));
        ((percent * u32::from(MAX_DUTY) + 50) / 100) as u8
    }

    /// Lit interval crosses midnight.
    pub fn is_overnight(&self) -> bool {
        self.off_time < self.on_time
    }

    pub fn ramp_start(&self) -> TimeOfDay {
        self.on_time.wrapping_sub(self.ramp_duration_minutes)
    }

    pub fn fade_start(&self) -> TimeOfDay {
        self.off_time.wrapping_sub(self.ramp_duration_minutes)
    }

    /// True when the ramp is longer than the lit or the dark interval, so the
    /// ramp-up and ramp-down windows intersect. Duty in the shared minutes is
    /// whatever the evaluation order yields; callers only warn about it.
    pub fn ramps_overlap(&self) -> bool {
        let lit = self.on_time.minutes_until(self.off_time);
        let dark = self.off_time.minutes_until(self.on_time);
        self.ramp_duration_minutes > lit || self.ramp_duration_minutes > dark
    }
}

/// Light schedule engine: target duty for `now` under `config`.
///
/// Pure and stateless. Windows are half-open and evaluated in order
/// ramp-up, ramp-down, fully lit; anything else is dark.
pub fn compute_duty_cycle(now: TimeOfDay, config: &ScheduleConfig) -> u8 {
    let max_duty = config.max_duty();
    if max_duty == 0 {
        return 0;
    }

    let on = config.on_time;
    let off = config.off_time;
    let ramp = config.ramp_duration_minutes;
    let ramp_start = config.ramp_start();
    let fade_start = config.fade_start();

    if in_window(now, ramp_start, on) {
        return interpolate(max_duty, ramp_start.minutes_until(now), ramp);
    }
    if in_window(now, fade_start, off) {
        return interpolate(max_duty, now.minutes_until(off), ramp);
    }

    let lit = if config.is_overnight() {
        in_window(now, on, fade_start)
    } else {
        on <= now && now < fade_start
    };

    if lit {
        max_duty
    } else {
        0
    }
}

/// Half-open `[start, end)` containment that wraps through midnight when
/// `end < start`. An empty window (`start == end`) contains nothing.
pub fn in_window(now: TimeOfDay, start: TimeOfDay, end: TimeOfDay) -> bool {
    if start <= end {
        start <= now && now < end
    } else {
        now >= start || now < end
    }
}

fn interpolate(max_duty: u8, elapsed: u16, span: u16) -> u8 {
    if span == 0 {
        return max_duty;
    }
    let elapsed = u32::from(elapsed.min(span));
    (u32::from(max_duty) * elapsed / u32::from(span)) as u8
}
