//! Small built-in services. Command text arrives normalized: lower case,
//! punctuation folded to single spaces, apostrophes kept.

use chrono::{Local, Timelike};
use parking_lot::Mutex;
use vox_core::text::{list_index, number_to_words, parse_number};
use vox_core::{CancelToken, Params, Payload, Result, ServicePlugin, VoxError};

use super::param_u64;

/// "say X" / "echo X" → "X".
pub struct EchoService;

const ECHO_PREFIXES: [&str; 2] = ["say ", "echo "];

impl ServicePlugin for EchoService {
    fn can_handle(&self, text: &str) -> bool {
        ECHO_PREFIXES
            .iter()
            .any(|p| text.strip_prefix(p).is_some_and(|rest| !rest.trim().is_empty()))
    }

    fn handle(&self, text: &str, _cancel: &CancelToken) -> Result<Payload> {
        let rest = ECHO_PREFIXES
            .iter()
            .find_map(|p| text.strip_prefix(p))
            .unwrap_or(text);
        Ok(Payload::text(rest.trim()))
    }
}

/// Speaks the local time.
pub struct ClockService;

const TIME_QUESTIONS: [&str; 4] = [
    "what time is it",
    "what's the time",
    "what is the time",
    "tell me the time",
];

impl ServicePlugin for ClockService {
    fn can_handle(&self, text: &str) -> bool {
        TIME_QUESTIONS.iter().any(|q| text.starts_with(q))
    }

    fn handle(&self, _text: &str, _cancel: &CancelToken) -> Result<Payload> {
        let now = Local::now();
        Ok(Payload::text(spoken_time(now.hour(), now.minute())))
    }
}

/// "three fifteen", "nine oh five", "twelve o'clock".
pub fn spoken_time(hour: u32, minute: u32) -> String {
    let hour = match hour % 12 {
        0 => 12,
        h => h,
    };
    let hour = number_to_words(f64::from(hour));
    match minute {
        0 => format!("it is {hour} o'clock"),
        1..=9 => format!("it is {hour} oh {}", number_to_words(f64::from(minute))),
        _ => format!("it is {hour} {}", number_to_words(f64::from(minute))),
    }
}

pub const MAX_VOLUME: u8 = 11;

/// Tracks a volume level in `0..=11`.
pub struct VolumeService {
    level: Mutex<u8>,
}

impl VolumeService {
    /// Params: `initial` (default 5).
    pub fn from_params(params: &Params) -> Result<Self> {
        let initial = param_u64(params, "initial")?.unwrap_or(5);
        if initial > u64::from(MAX_VOLUME) {
            return Err(VoxError::Configuration(format!(
                "initial volume {initial} is above {MAX_VOLUME}"
            )));
        }
        Ok(Self {
            level: Mutex::new(initial as u8),
        })
    }

    pub fn level(&self) -> u8 {
        *self.level.lock()
    }
}

enum VolumeChange {
    Up,
    Down,
    Set(String),
}

/// "set [the|my] volume to N", "volume up|down|N".
fn parse_volume_command(text: &str) -> Option<VolumeChange> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.first() == Some(&"set") {
        let at = list_index(&words, &["volume", "to"], 1).filter(|at| *at <= 2)?;
        let value = &words[at + 2..];
        return (!value.is_empty()).then(|| VolumeChange::Set(value.join(" ")));
    }
    match text.strip_prefix("volume ")?.trim() {
        "up" => Some(VolumeChange::Up),
        "down" => Some(VolumeChange::Down),
        other => parse_number(other).map(|_| VolumeChange::Set(other.to_string())),
    }
}

impl ServicePlugin for VolumeService {
    fn can_handle(&self, text: &str) -> bool {
        parse_volume_command(text).is_some()
    }

    fn handle(&self, text: &str, _cancel: &CancelToken) -> Result<Payload> {
        let change = parse_volume_command(text)
            .ok_or_else(|| VoxError::plugin(format!("not a volume command: {text:?}")))?;

        let mut level = self.level.lock();
        *level = match change {
            VolumeChange::Up => (*level + 1).min(MAX_VOLUME),
            VolumeChange::Down => level.saturating_sub(1),
            VolumeChange::Set(words) => {
                let value = parse_number(&words)
                    .ok_or_else(|| VoxError::plugin(format!("cannot understand volume {words:?}")))?;
                if value.fract() != 0.0 || !(0.0..=f64::from(MAX_VOLUME)).contains(&value) {
                    return Err(VoxError::plugin(
                        "volume must be a whole number between zero and eleven",
                    ));
                }
                value as u8
            }
        };
        Ok(Payload::text(format!(
            "volume is {}",
            number_to_words(f64::from(*level))
        )))
    }
}
