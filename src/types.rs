use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Biological profile used to pick hydration targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    /// Male hydration targets
    Male,
    /// Female hydration targets
    Female,
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Male => write!(f, "Male"),
            Self::Female => write!(f, "Female"),
        }
    }
}

/// Visual energy state derived from stamina
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvatarState {
    /// More than two thirds of stamina left
    Normal,
    /// More than one third of stamina left
    Tired,
    /// One third or less
    Exhausted,
}

impl fmt::Display for AvatarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Tired => write!(f, "Tired"),
            Self::Exhausted => write!(f, "Exhausted"),
        }
    }
}

/// Lifecycle state of the wireless link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No link and no reconnect pending
    Disconnected,
    /// Scanning for coasters
    Scanning,
    /// Connection attempt in flight
    Connecting,
    /// Link is up and usable
    Connected,
    /// Waiting for the next reconnect attempt
    Reconnecting {
        /// Attempt number about to run, starting at 1
        attempt: u32,
    },
}

impl LinkState {
    /// Whether commands can be written in this state
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting { attempt } => write!(f, "Reconnecting (attempt {attempt})"),
        }
    }
}

/// Immutable snapshot of the link published to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    /// Current lifecycle state
    pub state: LinkState,
    /// Device the link targets, if any
    pub device: Option<DeviceInfo>,
    /// Last transport error observed, if any
    pub last_error: Option<String>,
    /// Wall-clock time of the last transition
    pub changed_at: DateTime<Utc>,
}

impl LinkStatus {
    /// Initial snapshot before anything happened
    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            state: LinkState::Disconnected,
            device: None,
            last_error: None,
            changed_at: Utc::now(),
        }
    }
}

/// Signal quality bucket derived from RSSI
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkQuality {
    /// RSSI below -90 dBm
    Critical,
    /// RSSI in [-90, -80) dBm
    Poor,
    /// RSSI in [-80, -70) dBm
    Fair,
    /// RSSI in [-70, -60) dBm
    Good,
    /// RSSI at or above -60 dBm
    Excellent,
}

impl LinkQuality {
    /// Bucket an RSSI reading
    #[must_use]
    pub const fn from_rssi(rssi: i16) -> Self {
        if rssi >= -60 {
            Self::Excellent
        } else if rssi >= -70 {
            Self::Good
        } else if rssi >= -80 {
            Self::Fair
        } else if rssi >= -90 {
            Self::Poor
        } else {
            Self::Critical
        }
    }
}

impl fmt::Display for LinkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "Critical"),
            Self::Poor => write!(f, "Poor"),
            Self::Fair => write!(f, "Fair"),
            Self::Good => write!(f, "Good"),
            Self::Excellent => write!(f, "Excellent"),
        }
    }
}

/// Quality of the phone's internet connection, reported by the host app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    /// Not known yet
    Unknown,
    /// No connectivity
    Offline,
    /// Slow or metered
    Poor,
    /// Usable
    Good,
    /// Fast and unmetered
    Excellent,
}

/// Characteristic write mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Write request acknowledged at the GATT level
    WithResponse,
    /// Write command, fire and forget
    WithoutResponse,
}

impl WriteMode {
    /// Mode to fall back to when this one is rejected as unsupported
    #[must_use]
    pub const fn fallback(self) -> Self {
        match self {
            Self::WithResponse => Self::WithoutResponse,
            Self::WithoutResponse => Self::WithResponse,
        }
    }
}

/// Device information gathered while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable transport identifier (MAC address or platform UUID)
    pub id: String,
    /// Advertised device name
    pub name: String,
    /// Signal strength (RSSI)
    pub rssi: i16,
}

impl DeviceInfo {
    /// Create new device info
    #[must_use]
    pub const fn new(id: String, name: String, rssi: i16) -> Self {
        Self { id, name, rssi }
    }

    /// Signal quality bucket of the advertisement
    #[must_use]
    pub const fn quality(&self) -> LinkQuality {
        LinkQuality::from_rssi(self.rssi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_quality_from_rssi() {
        assert_eq!(LinkQuality::from_rssi(-45), LinkQuality::Excellent);
        assert_eq!(LinkQuality::from_rssi(-60), LinkQuality::Excellent);
        assert_eq!(LinkQuality::from_rssi(-61), LinkQuality::Good);
        assert_eq!(LinkQuality::from_rssi(-75), LinkQuality::Fair);
        assert_eq!(LinkQuality::from_rssi(-85), LinkQuality::Poor);
        assert_eq!(LinkQuality::from_rssi(-95), LinkQuality::Critical);
        assert!(LinkQuality::Critical < LinkQuality::Excellent);
    }

    #[test]
    fn test_write_mode_fallback() {
        assert_eq!(WriteMode::WithResponse.fallback(), WriteMode::WithoutResponse);
        assert_eq!(WriteMode::WithoutResponse.fallback(), WriteMode::WithResponse);
    }

    #[test]
    fn test_link_state_display() {
        assert_eq!(LinkState::Connected.to_string(), "Connected");
        assert_eq!(
            LinkState::Reconnecting { attempt: 3 }.to_string(),
            "Reconnecting (attempt 3)"
        );
        assert!(LinkState::Connected.is_connected());
        assert!(!LinkState::Scanning.is_connected());
    }

    #[test]
    fn test_device_info_creation() {
        let info = DeviceInfo::new("AA:BB".to_string(), "Coaster-01".to_string(), -72);
        assert_eq!(info.name, "Coaster-01");
        assert_eq!(info.quality(), LinkQuality::Fair);
    }

    #[test]
    fn test_gender_serde() {
        let json = serde_json::to_string(&Gender::Female).unwrap();
        assert_eq!(json, "\"female\"");
        let back: Gender = serde_json::from_str("\"male\"").unwrap();
        assert_eq!(back, Gender::Male);
    }
}
