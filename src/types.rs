use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::lenient;

/// The panel's own state as reported by `panelCondGet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelStatus {
    /// Raw mode tag, e.g. "Disarm", "Full Arm". See [`AlarmState::from_panel_mode`].
    #[serde(rename(deserialize = "mode_a1"), deserialize_with = "lenient::text")]
    pub mode: String,
    #[serde(rename(deserialize = "battery"), deserialize_with = "lenient::text", default)]
    pub battery_status: String,
    #[serde(rename(deserialize = "sig_gsm"), deserialize_with = "lenient::percent", default)]
    pub gsm_signal: u8,
    #[serde(rename(deserialize = "ac_fail"), deserialize_with = "lenient::flag", default)]
    pub ac_failure: bool,
}

impl PanelStatus {
    pub fn alarm_state(&self) -> AlarmState {
        AlarmState::from_panel_mode(&self.mode)
    }
}

/// One zone/device row from `deviceListGet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(deserialize_with = "lenient::int")]
    pub area: u32,
    #[serde(deserialize_with = "lenient::int")]
    pub zone: u32,
    pub name: String,
    pub type_f: String,
    pub status: String,
    #[serde(deserialize_with = "lenient::flag")]
    pub battery_ok: bool,
    #[serde(deserialize_with = "lenient::flag")]
    pub tamper_ok: bool,
    #[serde(deserialize_with = "lenient::text")]
    pub rssi: String,
    #[serde(rename(deserialize = "id"), deserialize_with = "lenient::text")]
    pub device_id: String,
}

const STATUS_ACTIVE: &[&str] = &[
    "Door Open",
    "Open",
    "Triggered",
    "Motion",
    "Alarm",
    "Active",
    "Tamper",
    "Low Battery",
];

const STATUS_IDLE: &[&str] = &[
    "Door Close",
    "Close",
    "Closed",
    "Normal",
    "Ready",
    "Standby",
    "OK",
];

const MODEL_NAMES: &[(&str, &str)] = &[
    ("IR", "Motion Detector"),
    ("PIR", "Motion Detector"),
    ("Water Sensor", "Water Leak Sensor"),
    ("Glass Break", "Glass Break Detector"),
    ("Remote", "Remote Controller"),
];

impl DeviceStatus {
    /// Whether the sensor currently reports an open/alarm condition.
    /// `None` when the status string is not recognised.
    pub fn is_active(&self) -> Option<bool> {
        let status = self.status.as_str();
        if STATUS_ACTIVE.contains(&status) {
            return Some(true);
        }
        if STATUS_IDLE.contains(&status) {
            return Some(false);
        }
        let lower = status.to_lowercase();
        if ["open", "motion", "alarm"].iter().any(|k| lower.contains(k)) {
            return Some(true);
        }
        if ["close", "normal", "ready"].iter().any(|k| lower.contains(k)) {
            return Some(false);
        }
        None
    }

    pub fn battery_low(&self) -> bool {
        !self.battery_ok
    }

    pub fn sensor_class(&self) -> Option<SensorClass> {
        SensorClass::from_device_type(&self.type_f)
    }

    /// Friendly model name for the device type, falling back to the raw tag.
    pub fn model_name(&self) -> &str {
        MODEL_NAMES
            .iter()
            .find(|(tag, _)| *tag == self.type_f)
            .map(|(_, name)| *name)
            .unwrap_or(self.type_f.as_str())
    }
}

static ZONE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)zone\s*0*(\d+)").expect("zone pattern is valid"));

/// One row of panel history. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    #[serde(deserialize_with = "lenient::text", default)]
    pub time: String,
    #[serde(deserialize_with = "lenient::int_or_zero", default)]
    pub area: u32,
    #[serde(alias = "action", deserialize_with = "lenient::text", default)]
    pub mode: String,
    #[serde(deserialize_with = "lenient::text", default)]
    pub user: String,
    #[serde(deserialize_with = "lenient::text", default)]
    pub source: String,
    #[serde(deserialize_with = "lenient::opt_u32", default)]
    pub zone: Option<u32>,
    #[serde(alias = "type_f", deserialize_with = "lenient::text", default)]
    pub device_type: String,
    #[serde(alias = "event", deserialize_with = "lenient::text", default)]
    pub msg: String,
    #[serde(deserialize_with = "lenient::opt_u64", default)]
    pub uid: Option<u64>,
    #[serde(deserialize_with = "lenient::text", default)]
    pub new_event: String,
    #[serde(deserialize_with = "lenient::text", default)]
    pub cid_event: String,
}

impl EventLogEntry {
    /// Zone the entry refers to: the explicit `zone` field when the panel
    /// sends one, otherwise a reference in `source` ("Zone 12", "Zone12").
    pub fn zone(&self) -> Option<u32> {
        if self.zone.is_some() {
            return self.zone;
        }
        ZONE_REF
            .captures(&self.source)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

impl fmt::Display for EventLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = if self.msg.is_empty() { &self.mode } else { &self.msg };
        write!(f, "{}: {}", self.time, what)
    }
}

/// Point-in-time bundle produced by one successful refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VestaData {
    pub panel: PanelStatus,
    pub devices: Vec<DeviceStatus>,
    /// Most recent first.
    pub event_log: Vec<EventLogEntry>,
}

impl VestaData {
    pub fn device(&self, device_id: &str) -> Option<&DeviceStatus> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn devices_in_zone(&self, area: u32, zone: u32) -> impl Iterator<Item = &DeviceStatus> {
        self.devices
            .iter()
            .filter(move |d| d.area == area && d.zone == zone)
    }

    pub fn latest_event(&self) -> Option<&EventLogEntry> {
        self.event_log.first()
    }

    pub fn is_triggered(&self, rules: &TriggerRules) -> bool {
        rules.is_triggered(&self.event_log)
    }

    /// Panel mode mapped to a normalized state, overridden by `Triggered`
    /// when the latest log entry says so.
    pub fn alarm_state(&self, rules: &TriggerRules) -> AlarmState {
        if self.is_triggered(rules) {
            AlarmState::Triggered
        } else {
            self.panel.alarm_state()
        }
    }
}

const DEFAULT_TRIGGER_CODES: &[&str] = &[
    "100", "101", "110", "111", "112", "113", "114", "115", "116", "117", "118", "120", "121",
    "122", "123", "124", "125", "130", "131", "132", "133", "134", "135", "136", "137", "138",
    "139", "140", "150", "151", "154", "158", "162",
];

const DEFAULT_DISARM_CODES: &[&str] = &[
    "400", "401", "403", "404", "406", "407", "408", "409", "441", "442", "456",
];

/// Contact ID conventions used to derive the triggered state from the log.
/// Firmware-specific; callers can extend the code sets.
#[derive(Debug, Clone)]
pub struct TriggerRules {
    pub trigger_tag: String,
    pub restore_tag: String,
    pub trigger_codes: HashSet<String>,
    pub disarm_codes: HashSet<String>,
}

impl Default for TriggerRules {
    fn default() -> Self {
        Self {
            trigger_tag: "Trigger".to_string(),
            restore_tag: "Restore".to_string(),
            trigger_codes: DEFAULT_TRIGGER_CODES.iter().map(|c| c.to_string()).collect(),
            disarm_codes: DEFAULT_DISARM_CODES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl TriggerRules {
    pub fn with_trigger_code(mut self, code: impl Into<String>) -> Self {
        self.trigger_codes.insert(code.into());
        self
    }

    pub fn with_disarm_code(mut self, code: impl Into<String>) -> Self {
        self.disarm_codes.insert(code.into());
        self
    }

    /// Only the head of the log counts: a newer restore or disarm clears it.
    pub fn is_triggered(&self, log: &[EventLogEntry]) -> bool {
        let Some(latest) = log.first() else {
            return false;
        };
        let code = latest.cid_event.trim();
        if latest.new_event == self.restore_tag || self.disarm_codes.contains(code) {
            return false;
        }
        latest.new_event == self.trigger_tag && self.trigger_codes.contains(code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlarmState {
    Disarmed,
    ArmedAway,
    ArmedHome,
    ArmedNight,
    Triggered,
    Unknown,
}

const MODE_TABLE: &[(&str, AlarmState)] = &[
    ("disarm", AlarmState::Disarmed),
    ("disarmed", AlarmState::Disarmed),
    ("arm", AlarmState::ArmedAway),
    ("full arm", AlarmState::ArmedAway),
    ("away", AlarmState::ArmedAway),
    ("arm away", AlarmState::ArmedAway),
    ("home", AlarmState::ArmedHome),
    ("home arm", AlarmState::ArmedHome),
    ("arm home", AlarmState::ArmedHome),
    ("part arm", AlarmState::ArmedHome),
    ("stay", AlarmState::ArmedHome),
    ("night", AlarmState::ArmedNight),
    ("arm night", AlarmState::ArmedNight),
    ("night arm", AlarmState::ArmedNight),
];

impl AlarmState {
    /// Case-insensitive lookup over the mode strings seen across firmware
    /// revisions. Unrecognised strings map to `Unknown`.
    pub fn from_panel_mode(mode: &str) -> Self {
        let mode = mode.trim().to_lowercase();
        MODE_TABLE
            .iter()
            .find(|(tag, _)| *tag == mode)
            .map(|(_, state)| *state)
            .unwrap_or(AlarmState::Unknown)
    }
}

/// Command values accepted by `panelCondPost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArmMode {
    Disarm,
    ArmAway,
    ArmHome,
    ArmNight,
}

impl ArmMode {
    pub fn code(&self) -> u8 {
        match self {
            ArmMode::Disarm => 0,
            ArmMode::ArmAway => 1,
            ArmMode::ArmHome => 2,
            ArmMode::ArmNight => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ArmMode::Disarm),
            1 => Some(ArmMode::ArmAway),
            2 => Some(ArmMode::ArmHome),
            3 => Some(ArmMode::ArmNight),
            _ => None,
        }
    }

    pub fn as_key(&self) -> &'static str {
        match self {
            ArmMode::Disarm => "disarm",
            ArmMode::ArmAway => "arm_away",
            ArmMode::ArmHome => "arm_home",
            ArmMode::ArmNight => "arm_night",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "disarm" => Some(ArmMode::Disarm),
            "arm_away" => Some(ArmMode::ArmAway),
            "arm_home" => Some(ArmMode::ArmHome),
            "arm_night" => Some(ArmMode::ArmNight),
            _ => None,
        }
    }

    /// State the panel should report once the command has applied.
    pub fn target_state(&self) -> AlarmState {
        match self {
            ArmMode::Disarm => AlarmState::Disarmed,
            ArmMode::ArmAway => AlarmState::ArmedAway,
            ArmMode::ArmHome => AlarmState::ArmedHome,
            ArmMode::ArmNight => AlarmState::ArmedNight,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SensorClass {
    Door,
    Motion,
    Smoke,
    CarbonMonoxide,
    Moisture,
    Vibration,
}

impl SensorClass {
    pub fn from_device_type(type_f: &str) -> Option<Self> {
        match type_f {
            "Door Contact" => Some(SensorClass::Door),
            "IR" | "PIR" => Some(SensorClass::Motion),
            "Smoke Detector" => Some(SensorClass::Smoke),
            "CO Detector" => Some(SensorClass::CarbonMonoxide),
            "Water Sensor" => Some(SensorClass::Moisture),
            "Glass Break" => Some(SensorClass::Vibration),
            _ => None,
        }
    }
}

/// Change notifications produced by comparing consecutive snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ModeChanged { mode: String, state: AlarmState },
    AlarmTriggered { entry: EventLogEntry },
    AlarmCleared,
    AcFailureChanged { failed: bool },
    PanelBatteryChanged { status: String },
    GsmSignalChanged { signal: u8 },

    DeviceAdded { device_id: String, name: String },
    DeviceRemoved { device_id: String, name: String },
    DeviceStatusChanged {
        device_id: String,
        name: String,
        zone: u32,
        status: String,
        active: Option<bool>,
    },
    DeviceBatteryChanged { device_id: String, name: String, battery_ok: bool },
    DeviceTamperChanged { device_id: String, name: String, tamper_ok: bool },

    NewLogEntries { entries: Vec<EventLogEntry> },
}
