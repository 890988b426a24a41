use crate::error::{CoasterError, Result};
use chrono::NaiveDateTime;
use std::fmt;

/// `strftime` layout of coaster timestamps (`YYMMDDhhmmss`)
pub const TIMESTAMP_FORMAT: &str = "%y%m%d%H%M%S";

/// Battery voltage mapped to 0%
pub const BATTERY_EMPTY_MV: u32 = 3_000;

/// Battery voltage mapped to 100%
pub const BATTERY_FULL_MV: u32 = 4_200;

/// Message used when an `ERR` line carries no text
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// One hydration log entry carried by a `DL` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLogEntry {
    /// Index assigned by the device firmware
    pub index: u32,
    /// Amount drunk, in millilitres
    pub amount_ml: u32,
    /// Device clock reading, if the firmware stamped the entry
    pub timestamp: Option<NaiveDateTime>,
}

/// A line sent by the coaster, classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceLine {
    /// `SDT` - a data-log transfer starts
    DataStart,
    /// `DL <index> <ml> [timestamp]`
    DataLog(DataLogEntry),
    /// `END` - the transfer is over
    End,
    /// `ACK` - acknowledges the last `GOAL` or `SYNC`
    Ack,
    /// `ERR[ message]`
    Error(String),
    /// `DEV <pct>` or `BATT <mV>`, normalised to percent
    Battery(u8),
    /// `READY` - device accepts commands
    Ready,
}

/// Classify a single line from the device.
///
/// Returns `Ok(None)` for lines that are not part of the protocol, so the caller
/// can route them to raw display. Returns [`CoasterError::ParseError`] when the
/// keyword is recognised but its arguments are malformed.
///
/// # Errors
///
/// Returns [`CoasterError::ParseError`] for malformed `DL`, `DEV` or `BATT` lines.
pub fn parse_line(line: &str) -> Result<Option<DeviceLine>> {
    let trimmed = line.trim();
    let mut tokens = trimmed.split_whitespace();
    let Some(raw_keyword) = tokens.next() else {
        return Ok(None);
    };
    if let Some(inline) = error_keyword_remainder(raw_keyword) {
        let tail = trimmed.get(raw_keyword.len()..).unwrap_or_default();
        return Ok(Some(DeviceLine::Error(error_message(inline, tail))));
    }
    let keyword = raw_keyword.to_ascii_uppercase();

    let parsed = match keyword.as_str() {
        "SDT" => DeviceLine::DataStart,
        "END" => DeviceLine::End,
        "ACK" => DeviceLine::Ack,
        "READY" => DeviceLine::Ready,
        "DL" => DeviceLine::DataLog(parse_data_log(tokens.collect(), trimmed)?),
        "DEV" => {
            let value = parse_number::<i64>(tokens.next(), trimmed)?;
            DeviceLine::Battery(clamp_percent(value))
        }
        "BATT" => {
            let millivolts = parse_number::<i64>(tokens.next(), trimmed)?;
            DeviceLine::Battery(millivolts_to_percent(millivolts))
        }
        _ => return Ok(None),
    };

    Ok(Some(parsed))
}

/// `ERR`, `ERROR`, `ERR:<text>` or `ERROR:<text>`; yields the text glued to the colon
fn error_keyword_remainder(keyword: &str) -> Option<&str> {
    let upper = keyword.to_ascii_uppercase();
    let prefix = if upper.starts_with("ERROR") {
        "ERROR".len()
    } else if upper.starts_with("ERR") {
        "ERR".len()
    } else {
        return None;
    };
    let rest = keyword.get(prefix..)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix(':')
    }
}

fn error_message(inline: &str, tail: &str) -> String {
    let message = format!("{inline}{tail}");
    let message = message.trim();
    if message.is_empty() {
        UNKNOWN_ERROR.to_string()
    } else {
        message.to_string()
    }
}

fn parse_data_log(args: Vec<&str>, line: &str) -> Result<DataLogEntry> {
    if args.len() < 2 || args.len() > 3 {
        return Err(CoasterError::ParseError(format!(
            "DL expects 2 or 3 arguments: {line}"
        )));
    }

    let index = parse_number::<u32>(Some(args[0]), line)?;
    let amount_ml = parse_number::<u32>(Some(args[1]), line)?;
    let timestamp = match args.get(2) {
        Some(raw) => Some(parse_timestamp(raw)?),
        None => None,
    };

    Ok(DataLogEntry {
        index,
        amount_ml,
        timestamp,
    })
}

fn parse_number<T: std::str::FromStr>(token: Option<&str>, line: &str) -> Result<T> {
    token
        .and_then(|t| t.parse::<T>().ok())
        .ok_or_else(|| CoasterError::ParseError(format!("Invalid numeric argument: {line}")))
}

fn clamp_percent(value: i64) -> u8 {
    u8::try_from(value.clamp(0, 100)).unwrap_or(100)
}

/// Map a battery voltage linearly onto 0-100%
#[must_use]
pub fn millivolts_to_percent(millivolts: i64) -> u8 {
    let empty = i64::from(BATTERY_EMPTY_MV);
    let span = i64::from(BATTERY_FULL_MV - BATTERY_EMPTY_MV);
    let scaled = ((millivolts - empty) * 100 + span / 2) / span;
    clamp_percent(scaled)
}

/// Parse a `YYMMDDhhmmss` device timestamp
///
/// # Errors
///
/// Returns [`CoasterError::ParseError`] if the text is not a valid timestamp.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    if raw.len() != 12 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoasterError::ParseError(format!("Invalid timestamp: {raw}")));
    }
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|e| CoasterError::ParseError(format!("Invalid timestamp {raw}: {e}")))
}

/// Format a device clock reading as `YYMMDDhhmmss`
#[must_use]
pub fn format_timestamp(time: &NaiveDateTime) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

/// Commands sent from the app to the coaster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `GET ALL` - retransmit the full log
    GetAll,
    /// `GOAL <ml> <minutes>` - hydration target per interval
    Goal {
        /// Target amount per interval in millilitres
        ml: u32,
        /// Interval length in minutes
        minutes: u32,
    },
    /// `SYNC <YYMMDDhhmmss>` - set the device clock
    Sync(NaiveDateTime),
    /// `GET BATT` - battery request, doubles as keep-alive
    GetBattery,
}

impl Command {
    /// Build a validated `GOAL` command
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::InvalidParameters`] if either value is zero.
    pub fn goal(ml: u32, minutes: u32) -> Result<Self> {
        if ml == 0 || minutes == 0 {
            return Err(CoasterError::InvalidParameters(format!(
                "GOAL needs non-zero amount and interval (got {ml} ml / {minutes} min)"
            )));
        }
        Ok(Self::Goal { ml, minutes })
    }

    /// Short name used in logs and statistics
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GetAll => "GET ALL",
            Self::Goal { .. } => "GOAL",
            Self::Sync(_) => "SYNC",
            Self::GetBattery => "GET BATT",
        }
    }

    /// Whether the device answers this command with `ACK`
    #[must_use]
    pub const fn expects_ack(&self) -> bool {
        matches!(self, Self::Goal { .. } | Self::Sync(_))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetAll => write!(f, "GET ALL"),
            Self::Goal { ml, minutes } => write!(f, "GOAL {ml} {minutes}"),
            Self::Sync(time) => write!(f, "SYNC {}", format_timestamp(time)),
            Self::GetBattery => write!(f, "GET BATT"),
        }
    }
}
