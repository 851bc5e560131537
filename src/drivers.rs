use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::Arc;

use crate::light::{self, Light, MAX_BRIGHTNESS, MIN_BRIGHTNESS};
use crate::session::DeviceSession;

// -- DPS attribute tables --
//
// Tuya devices publish numbered datapoint slots ("DPS"). Each driver maps
// slot N to the attribute at table index N-1 and coerces application values
// into the wire representation the firmware expects.

/// One DPS slot: attribute name plus outbound value coercion.
pub struct DpsAttr {
    pub name: &'static str,
    pub coerce: fn(&Value) -> Result<Value, DriverError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Switch,
    OpenCloseSwitch,
    Light,
}

#[derive(Debug, Clone)]
pub enum DriverError {
    UnknownAttribute(String),
    InvalidValue { attr: &'static str, raw: String },
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::UnknownAttribute(name) => write!(f, "Unknown attribute: {name}"),
            DriverError::InvalidValue { attr, raw } => {
                write!(f, "Invalid value for {attr}: {raw}")
            }
        }
    }
}

impl std::error::Error for DriverError {}

static SWITCH_ATTRS: &[DpsAttr] = &[DpsAttr {
    name: "power",
    coerce: coerce_power,
}];

static OPEN_CLOSE_ATTRS: &[DpsAttr] = &[DpsAttr {
    name: "state",
    coerce: coerce_oc_state,
}];

static LIGHT_ATTRS: &[DpsAttr] = &[
    DpsAttr {
        name: "power",
        coerce: coerce_power,
    },
    DpsAttr {
        name: "mode",
        coerce: coerce_mode,
    },
    DpsAttr {
        name: "brightness",
        coerce: coerce_brightness,
    },
    DpsAttr {
        name: "temperature",
        coerce: coerce_temperature,
    },
    DpsAttr {
        name: "colour",
        coerce: coerce_colour,
    },
];

/// Attribute table and normalization rules for one session. A profile with no
/// kind is the generic probe used during classification: it maps nothing, so
/// every DPS slot surfaces under its numeric key when raw mode is on.
#[derive(Debug, Clone, Copy)]
pub struct DriverProfile {
    pub kind: Option<DeviceKind>,
    pub inverted: bool,
}

impl DriverProfile {
    pub fn probe() -> Self {
        Self {
            kind: None,
            inverted: false,
        }
    }

    pub fn switch() -> Self {
        Self {
            kind: Some(DeviceKind::Switch),
            inverted: false,
        }
    }

    pub fn open_close(inverted: bool) -> Self {
        Self {
            kind: Some(DeviceKind::OpenCloseSwitch),
            inverted,
        }
    }

    pub fn light() -> Self {
        Self {
            kind: Some(DeviceKind::Light),
            inverted: false,
        }
    }

    pub fn attrs(&self) -> &'static [DpsAttr] {
        match self.kind {
            None => &[],
            Some(DeviceKind::Switch) => SWITCH_ATTRS,
            Some(DeviceKind::OpenCloseSwitch) => OPEN_CLOSE_ATTRS,
            Some(DeviceKind::Light) => LIGHT_ATTRS,
        }
    }

    /// Table position of a named attribute; DPS slot is position + 1.
    pub fn dps_index(&self, name: &str) -> Option<usize> {
        self.attrs().iter().position(|attr| attr.name == name)
    }

    pub fn attr_name(&self, index: usize) -> Option<&'static str> {
        self.attrs().get(index).map(|attr| attr.name)
    }

    pub fn coerce(&self, name: &str, value: &Value) -> Result<Value, DriverError> {
        let attr = self
            .attrs()
            .iter()
            .find(|attr| attr.name == name)
            .ok_or_else(|| DriverError::UnknownAttribute(name.to_owned()))?;
        (attr.coerce)(value)
    }

    /// DPS write some hardware needs before it starts reporting.
    pub fn initial_dps(&self) -> Option<Value> {
        match self.kind {
            // curtain motors stay mute until they see a set
            Some(DeviceKind::OpenCloseSwitch) => Some(json!({"1": "3"})),
            _ => None,
        }
    }

    /// Rewrite an inbound record into the shape surfaced to observers.
    pub fn normalize(&self, record: &mut Map<String, Value>) {
        match self.kind {
            None => {}
            Some(DeviceKind::Switch) => {
                if let Some(power) = record.get("power").and_then(Value::as_bool) {
                    record.insert(
                        "power".to_owned(),
                        json!(if power { "on" } else { "off" }),
                    );
                }
            }
            Some(DeviceKind::OpenCloseSwitch) => {
                if let Some(state) = record.get("state").and_then(Value::as_str) {
                    let moving = match state {
                        "1" => Some(true),
                        "2" => Some(false),
                        _ => None,
                    };
                    let label = match moving {
                        Some(opening) => {
                            if opening != self.inverted {
                                "opening"
                            } else {
                                "closing"
                            }
                        }
                        None => "idling",
                    };
                    record.insert("state".to_owned(), json!(label));
                }
            }
            Some(DeviceKind::Light) => {
                if let Some(power) = record.get("power").and_then(Value::as_bool) {
                    record.insert("power".to_owned(), json!(if power { "On" } else { "Off" }));
                }
                if let Some(dps) = record.get("temperature").and_then(Value::as_i64) {
                    record.insert("temperature".to_owned(), json!(light::dps_to_kelvin(dps)));
                }
                if let Some(colour) = record.get("colour").and_then(Value::as_str) {
                    if let Some(hsv) = light::tuya_to_hsv(colour) {
                        record.insert("colour".to_owned(), json!(hsv));
                    }
                }
            }
        }
    }
}

// -- Value coercions --

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => matches!(s.as_str(), "on" | "On" | "ON" | "oN"),
        _ => false,
    }
}

fn coerce_power(value: &Value) -> Result<Value, DriverError> {
    Ok(Value::Bool(truthy(value)))
}

fn coerce_oc_state(value: &Value) -> Result<Value, DriverError> {
    let s = value.as_str().ok_or_else(|| DriverError::InvalidValue {
        attr: "state",
        raw: value.to_string(),
    })?;
    let position = ["open", "close", "idle"]
        .iter()
        .position(|&known| known == s.to_lowercase())
        .ok_or_else(|| DriverError::InvalidValue {
            attr: "state",
            raw: s.to_owned(),
        })?;
    Ok(json!((position + 1).to_string()))
}

fn coerce_mode(value: &Value) -> Result<Value, DriverError> {
    let s = value.as_str().ok_or_else(|| DriverError::InvalidValue {
        attr: "mode",
        raw: value.to_string(),
    })?;
    let lower = s.to_lowercase();
    let mode = match lower.as_str() {
        "white" | "colour" | "scene" | "scene_1" | "scene_2" | "scene_3" | "scene_4" => lower,
        _ => "white".to_owned(),
    };
    Ok(json!(mode))
}

fn coerce_brightness(value: &Value) -> Result<Value, DriverError> {
    let n = value.as_i64().ok_or_else(|| DriverError::InvalidValue {
        attr: "brightness",
        raw: value.to_string(),
    })?;
    Ok(json!(n.clamp(MIN_BRIGHTNESS, MAX_BRIGHTNESS)))
}

fn coerce_temperature(value: &Value) -> Result<Value, DriverError> {
    let kelvin = value.as_i64().ok_or_else(|| DriverError::InvalidValue {
        attr: "temperature",
        raw: value.to_string(),
    })?;
    Ok(json!(light::kelvin_to_dps(kelvin)))
}

fn coerce_colour(value: &Value) -> Result<Value, DriverError> {
    let hsv = value
        .as_array()
        .filter(|parts| parts.len() == 3)
        .and_then(|parts| {
            let h = parts[0].as_i64()?;
            let s = parts[1].as_i64()?;
            let v = parts[2].as_i64()?;
            Some([h, s, v])
        })
        .ok_or_else(|| DriverError::InvalidValue {
            attr: "colour",
            raw: value.to_string(),
        })?;
    Ok(json!(light::hsv_to_tuya(hsv)))
}

// -- Typed device handles --

/// A plain on/off switch.
#[derive(Clone)]
pub struct Switch {
    session: Arc<DeviceSession>,
}

impl Switch {
    pub fn new(session: Arc<DeviceSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    pub fn on(&self) {
        self.set_power(true);
    }

    pub fn off(&self) {
        self.set_power(false);
    }

    pub fn set_power(&self, on: bool) {
        if let Err(e) = self.session.set(&[("power", json!(on))]) {
            tracing::debug!(device_id = %self.session.device_id(), error = %e, "could not set switch power");
        }
    }

    /// Last reported power state ("on"/"off"), if any.
    pub fn power(&self) -> Option<Value> {
        self.session.status_value("power")
    }
}

/// Curtain-style open/close/idle motor.
///
/// `inverted` swaps open and close at this API boundary for units that were
/// wired backwards; the wire values are untouched.
#[derive(Clone)]
pub struct OpenCloseSwitch {
    session: Arc<DeviceSession>,
}

impl OpenCloseSwitch {
    pub fn new(session: Arc<DeviceSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    pub fn inverted(&self) -> bool {
        self.session.profile().inverted
    }

    pub fn open(&self) {
        self.send_state(if self.inverted() { "close" } else { "open" });
    }

    pub fn close(&self) {
        self.send_state(if self.inverted() { "open" } else { "close" });
    }

    pub fn idle(&self) {
        self.send_state("idle");
    }

    pub fn set_state(&self, state: &str) {
        let lower = state.to_lowercase();
        let effective = if self.inverted() {
            match lower.as_str() {
                "open" => "close",
                "close" => "open",
                other => other,
            }
        } else {
            lower.as_str()
        };
        self.send_state(effective);
    }

    /// Last reported motion state ("opening"/"closing"/"idling"), if any.
    pub fn state(&self) -> Option<Value> {
        self.session.status_value("state")
    }

    fn send_state(&self, state: &str) {
        if let Err(e) = self.session.set(&[("state", json!(state))]) {
            tracing::debug!(device_id = %self.session.device_id(), error = %e, "could not set motor state");
        }
    }
}

/// A classified, running device of any supported kind.
#[derive(Clone)]
pub enum TypedDevice {
    Switch(Switch),
    OpenCloseSwitch(OpenCloseSwitch),
    Light(Light),
}

impl TypedDevice {
    pub fn kind(&self) -> DeviceKind {
        match self {
            TypedDevice::Switch(_) => DeviceKind::Switch,
            TypedDevice::OpenCloseSwitch(_) => DeviceKind::OpenCloseSwitch,
            TypedDevice::Light(_) => DeviceKind::Light,
        }
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        match self {
            TypedDevice::Switch(device) => device.session(),
            TypedDevice::OpenCloseSwitch(device) => device.session(),
            TypedDevice::Light(device) => device.session(),
        }
    }

    pub fn close(&self) {
        self.session().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_accepts_the_truthy_set() {
        for value in [json!(true), json!(1), json!("on"), json!("On"), json!("ON"), json!("oN")] {
            assert_eq!(coerce_power(&value).unwrap(), json!(true), "{value}");
        }
        for value in [json!(false), json!(0), json!("off"), json!("yes"), json!(2)] {
            assert_eq!(coerce_power(&value).unwrap(), json!(false), "{value}");
        }
    }

    #[test]
    fn oc_state_maps_to_wire_digits() {
        assert_eq!(coerce_oc_state(&json!("open")).unwrap(), json!("1"));
        assert_eq!(coerce_oc_state(&json!("close")).unwrap(), json!("2"));
        assert_eq!(coerce_oc_state(&json!("idle")).unwrap(), json!("3"));
        assert_eq!(coerce_oc_state(&json!("Open")).unwrap(), json!("1"));
        assert!(coerce_oc_state(&json!("ajar")).is_err());
        assert!(coerce_oc_state(&json!(1)).is_err());
    }

    #[test]
    fn unknown_mode_falls_back_to_white() {
        assert_eq!(coerce_mode(&json!("colour")).unwrap(), json!("colour"));
        assert_eq!(coerce_mode(&json!("SCENE_2")).unwrap(), json!("scene_2"));
        assert_eq!(coerce_mode(&json!("disco")).unwrap(), json!("white"));
    }

    #[test]
    fn brightness_clamps_to_device_range() {
        assert_eq!(coerce_brightness(&json!(128)).unwrap(), json!(128));
        assert_eq!(coerce_brightness(&json!(0)).unwrap(), json!(25));
        assert_eq!(coerce_brightness(&json!(999)).unwrap(), json!(255));
    }

    #[test]
    fn switch_normalize_stringifies_power() {
        let profile = DriverProfile::switch();
        let mut record = Map::new();
        record.insert("power".to_owned(), json!(true));
        profile.normalize(&mut record);
        assert_eq!(record["power"], json!("on"));
    }

    #[test]
    fn oc_normalize_reports_motion() {
        let profile = DriverProfile::open_close(false);
        for (wire, label) in [("1", "opening"), ("2", "closing"), ("3", "idling")] {
            let mut record = Map::new();
            record.insert("state".to_owned(), json!(wire));
            profile.normalize(&mut record);
            assert_eq!(record["state"], json!(label), "wire {wire}");
        }
    }

    #[test]
    fn oc_normalize_swaps_when_inverted() {
        let profile = DriverProfile::open_close(true);
        let mut record = Map::new();
        record.insert("state".to_owned(), json!("1"));
        profile.normalize(&mut record);
        assert_eq!(record["state"], json!("closing"));
    }

    #[test]
    fn light_normalize_maps_back_to_application_units() {
        let profile = DriverProfile::light();
        let mut record = Map::new();
        record.insert("power".to_owned(), json!(true));
        record.insert("temperature".to_owned(), json!(255));
        record.insert("colour".to_owned(), json!("ff00000000ffff"));
        profile.normalize(&mut record);
        assert_eq!(record["power"], json!("On"));
        assert_eq!(record["temperature"], json!(9000));
        assert_eq!(record["colour"], json!([0, 100, 100]));
    }

    #[test]
    fn probe_profile_maps_nothing() {
        let profile = DriverProfile::probe();
        assert!(profile.attr_name(0).is_none());
        assert!(profile.dps_index("power").is_none());
    }

    #[test]
    fn dps_indices_follow_table_order() {
        let profile = DriverProfile::light();
        assert_eq!(profile.dps_index("power"), Some(0));
        assert_eq!(profile.dps_index("colour"), Some(4));
        assert_eq!(profile.attr_name(2), Some("brightness"));
        assert!(profile.coerce("sparkle", &json!(1)).is_err());
    }
}
