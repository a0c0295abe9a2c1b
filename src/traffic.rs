//! Diurnal and weekly traffic shaping.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use std::f64::consts::PI;

const BUSINESS_START_HOUR: f64 = 9.0;
const BUSINESS_END_HOUR: f64 = 18.0;
const NIGHT_START_HOUR: f64 = 22.0;
const NIGHT_END_HOUR: f64 = 6.0;
// Business-hours curve peaks here
const PEAK_HOUR: f64 = 14.5;

/// Traffic multiplier for a fractional hour of day.
///
/// Business hours follow a cosine centred on mid-afternoon (≈0.83 at 09:00,
/// 1.3 at 14:30); night hours sit at 0.2–0.3, lowest around 02:00; the
/// shoulders ramp linearly between 0.5 and 0.8.
pub fn hourly_multiplier(hour: f64) -> f64 {
    if (BUSINESS_START_HOUR..=BUSINESS_END_HOUR).contains(&hour) {
        1.05 + 0.25 * ((hour - PEAK_HOUR) * PI / 6.5).cos()
    } else if hour >= NIGHT_START_HOUR || hour < NIGHT_END_HOUR {
        let since_midnight = if hour >= NIGHT_START_HOUR { hour - 24.0 } else { hour };
        (0.2 + 0.1 * ((since_midnight - 2.0).abs() / 4.0)).clamp(0.2, 0.3)
    } else if hour < BUSINESS_START_HOUR {
        0.5 + 0.3 * (hour - NIGHT_END_HOUR) / (BUSINESS_START_HOUR - NIGHT_END_HOUR)
    } else {
        0.8 - 0.3 * (hour - BUSINESS_END_HOUR) / (NIGHT_START_HOUR - BUSINESS_END_HOUR)
    }
}

/// Traffic shape at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrafficShape {
    pub hour_of_day: f64,
    pub hourly: f64,
    pub weekend: f64,
}

impl TrafficShape {
    pub fn at(now: DateTime<Utc>, utc_offset_hours: i32, weekend_factor: f64) -> Self {
        let local = now + Duration::hours(i64::from(utc_offset_hours));
        let hour_of_day = f64::from(local.hour())
            + f64::from(local.minute()) / 60.0
            + f64::from(local.second()) / 3600.0;
        let weekend = match local.weekday() {
            Weekday::Sat | Weekday::Sun => weekend_factor,
            _ => 1.0,
        };
        Self {
            hour_of_day,
            hourly: hourly_multiplier(hour_of_day),
            weekend,
        }
    }

    pub fn multiplier(&self) -> f64 {
        self.hourly * self.weekend
    }
}
