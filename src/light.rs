use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::session::DeviceSession;

pub const MIN_KELVIN: i64 = 2000;
pub const MAX_KELVIN: i64 = 9000;
pub const MIN_BRIGHTNESS: i64 = 25;
pub const MAX_BRIGHTNESS: i64 = 255;

/// Interval between transition steps.
const STEP_INTERVAL: Duration = Duration::from_millis(200);
/// Poll interval and budget while waiting for a cancelled transition to release.
const CANCEL_POLL: Duration = Duration::from_millis(100);
const CANCEL_POLLS: u32 = 3;

// -- Colour space conversions --
//
// The firmware's colour DPS is a 14-hex-digit string `rrggbb00hhssvv`: an RGB
// rendering of the colour followed by the HSV components, every byte scaled
// to 0..255.

/// Encode `[h (0-360), s (0-100), v (0-100)]` as the wire colour string.
pub fn hsv_to_tuya(hsv: [i64; 3]) -> String {
    let [h, s, v] = hsv;
    let (r, g, b) = hsv_to_rgb(h as f64 / 360.0, s as f64 / 100.0, v as f64 / 100.0);
    format!(
        "{:02x}{:02x}{:02x}00{:02x}{:02x}{:02x}",
        scale_byte(r * 255.0),
        scale_byte(g * 255.0),
        scale_byte(b * 255.0),
        scale_byte(h as f64 * 255.0 / 360.0),
        scale_byte(s as f64 * 255.0 / 100.0),
        scale_byte(v as f64 * 255.0 / 100.0),
    )
}

/// Encode `[r, g, b]` (0-255 each) as the wire colour string.
pub fn rgb_to_tuya(rgb: [u8; 3]) -> String {
    let [r, g, b] = rgb;
    let (h, s, v) = rgb_to_hsv(r as f64 / 255.0, g as f64 / 255.0, b as f64 / 255.0);
    format!(
        "{r:02x}{g:02x}{b:02x}00{:02x}{:02x}{:02x}",
        scale_byte(h * 255.0),
        scale_byte(s * 255.0),
        scale_byte(v * 255.0),
    )
}

/// Decode the HSV tail of a wire colour string back to `[h, s, v]`.
pub fn tuya_to_hsv(colour: &str) -> Option<[i64; 3]> {
    if colour.len() < 6 || !colour.is_ascii() {
        return None;
    }
    let tail = &colour[colour.len() - 6..];
    let h = i64::from_str_radix(&tail[0..2], 16).ok()?;
    let s = i64::from_str_radix(&tail[2..4], 16).ok()?;
    let v = i64::from_str_radix(&tail[4..6], 16).ok()?;
    Some([
        (h as f64 * 360.0 / 255.0).round() as i64,
        (s as f64 * 100.0 / 255.0).round() as i64,
        (v as f64 * 100.0 / 255.0).round() as i64,
    ])
}

/// Decode the RGB head of a wire colour string.
pub fn tuya_to_rgb(colour: &str) -> Option<[u8; 3]> {
    if colour.len() < 6 || !colour.is_ascii() {
        return None;
    }
    let r = u8::from_str_radix(&colour[0..2], 16).ok()?;
    let g = u8::from_str_radix(&colour[2..4], 16).ok()?;
    let b = u8::from_str_radix(&colour[4..6], 16).ok()?;
    Some([r, g, b])
}

/// Colour temperature in Kelvin to the 0..255 white-balance DPS value.
/// Linear over [2000 K, 9000 K]; anything colder maps to 0.
pub fn kelvin_to_dps(kelvin: i64) -> i64 {
    if kelvin < MIN_KELVIN {
        return 0;
    }
    let clamped = kelvin.min(MAX_KELVIN);
    (((clamped - MIN_KELVIN) * 255) as f64 / (MAX_KELVIN - MIN_KELVIN) as f64).round() as i64
}

pub fn dps_to_kelvin(dps: i64) -> i64 {
    MIN_KELVIN + (((MAX_KELVIN - MIN_KELVIN) * dps) as f64 / 255.0).round() as i64
}

fn scale_byte(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn hsv_to_rgb(h: f64, s: f64, v: f64) -> (f64, f64, f64) {
    if s == 0.0 {
        return (v, v, v);
    }
    let sector = (h * 6.0).floor();
    let f = h * 6.0 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match (sector as i64).rem_euclid(6) {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}

fn rgb_to_hsv(r: f64, g: f64, b: f64) -> (f64, f64, f64) {
    let maxc = r.max(g).max(b);
    let minc = r.min(g).min(b);
    let v = maxc;
    if maxc == minc {
        return (0.0, 0.0, v);
    }
    let s = (maxc - minc) / maxc;
    let rc = (maxc - r) / (maxc - minc);
    let gc = (maxc - g) / (maxc - minc);
    let bc = (maxc - b) / (maxc - minc);
    let h = if r == maxc {
        bc - gc
    } else if g == maxc {
        2.0 + rc - bc
    } else {
        4.0 + gc - rc
    };
    ((h / 6.0).rem_euclid(1.0), s, v)
}

// -- Light handle --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransitionState {
    Idle,
    Running,
    CancelRequested,
}

struct LightState {
    transition: Mutex<TransitionState>,
    /// Brightness and Kelvin to restore when turned back on in white mode.
    last_white: Mutex<[i64; 2]>,
    /// HSV to restore when turned back on in colour mode.
    last_colour: Mutex<[i64; 3]>,
}

/// An RGB/white bulb. Beyond plain datapoint writes it can run timed fades
/// of white balance or colour, one at a time per bulb; starting a new fade
/// cancels the running one cooperatively.
#[derive(Clone)]
pub struct Light {
    session: Arc<DeviceSession>,
    state: Arc<LightState>,
}

impl Light {
    pub fn new(session: Arc<DeviceSession>) -> Self {
        Self {
            session,
            state: Arc::new(LightState {
                transition: Mutex::new(TransitionState::Idle),
                last_white: Mutex::new([50, 6500]),
                last_colour: Mutex::new([180, 50, 50]),
            }),
        }
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    /// Turn on, restoring the last white or colour settings seen for the
    /// bulb's current mode.
    pub fn on(&self) {
        match self.status_str("mode").as_deref() {
            Some("white") => {
                let [brightness, kelvin] = *self.state.last_white.lock().unwrap();
                self.set_white(brightness, kelvin);
            }
            Some("colour") => {
                let colour = *self.state.last_colour.lock().unwrap();
                self.set_colour(colour);
            }
            _ => self.set_power(true),
        }
    }

    /// Turn off, remembering the current white or colour settings.
    pub fn off(&self) {
        match self.status_str("mode").as_deref() {
            Some("white") => {
                if let (Some(brightness), Some(kelvin)) =
                    (self.status_i64("brightness"), self.status_i64("temperature"))
                {
                    *self.state.last_white.lock().unwrap() = [brightness, kelvin];
                }
            }
            Some("colour") => {
                if let Some(colour) = self.status_colour() {
                    *self.state.last_colour.lock().unwrap() = colour;
                }
            }
            _ => {}
        }
        self.set_power(false);
    }

    /// White mode at the given brightness (25-255) and temperature (Kelvin).
    pub fn set_white(&self, brightness: i64, kelvin: i64) {
        tracing::debug!(device_id = %self.session.device_id(), brightness, kelvin, "set white");
        if let Err(e) = self.session.set(&[
            ("power", json!(true)),
            ("mode", json!("white")),
            ("brightness", json!(brightness)),
            ("temperature", json!(kelvin)),
        ]) {
            tracing::debug!(device_id = %self.session.device_id(), error = %e, "could not set white");
        }
    }

    /// Colour mode at `[h (0-360), s (0-100), v (0-100)]`.
    pub fn set_colour(&self, hsv: [i64; 3]) {
        if let Err(e) = self.session.set(&[
            ("power", json!(true)),
            ("mode", json!("colour")),
            ("colour", json!(hsv)),
        ]) {
            tracing::debug!(device_id = %self.session.device_id(), error = %e, "could not set colour");
        } else {
            *self.state.last_colour.lock().unwrap() = hsv;
        }
    }

    /// Colour mode from an RGB triple.
    pub fn set_colour_rgb(&self, rgb: [u8; 3]) {
        let (h, s, v) = rgb_to_hsv(
            rgb[0] as f64 / 255.0,
            rgb[1] as f64 / 255.0,
            rgb[2] as f64 / 255.0,
        );
        self.set_colour([
            (h * 360.0).round() as i64,
            (s * 100.0).round() as i64,
            (v * 100.0).round() as i64,
        ]);
    }

    fn set_power(&self, on: bool) {
        if let Err(e) = self.session.set(&[("power", json!(on))]) {
            tracing::debug!(device_id = %self.session.device_id(), error = %e, "could not set power");
        }
    }

    // -- Timed transitions --

    /// Ramp white mode up from minimum brightness to the given endpoint.
    pub fn fade_in_white(&self, brightness: i64, kelvin: i64, duration_secs: f64) -> JoinHandle<()> {
        self.spawn_white([MIN_BRIGHTNESS, kelvin], [brightness, kelvin], duration_secs)
    }

    /// Ramp white mode down to minimum brightness, then off.
    pub fn fade_out_white(&self, duration_secs: f64) -> JoinHandle<()> {
        let brightness = self.status_i64("brightness").unwrap_or(MIN_BRIGHTNESS);
        let kelvin = self.status_i64("temperature").unwrap_or(6500);
        *self.state.last_white.lock().unwrap() = [brightness, kelvin];
        self.spawn_white([brightness, kelvin], [MIN_BRIGHTNESS, kelvin], duration_secs)
    }

    /// Fade white mode from the current settings to `[brightness, kelvin]`.
    pub fn transition_white(&self, end: [i64; 2], duration_secs: f64) -> JoinHandle<()> {
        let start = [
            self.status_i64("brightness").unwrap_or(end[0]),
            self.status_i64("temperature").unwrap_or(end[1]),
        ];
        self.spawn_white(start, end, duration_secs)
    }

    /// Fade colour in from black to the given HSV endpoint.
    pub fn fade_in_colour(&self, colour: [i64; 3], duration_secs: f64) -> JoinHandle<()> {
        self.spawn_colour([colour[0], colour[1], 0], colour, duration_secs)
    }

    /// Fade the current colour down to black, then off.
    pub fn fade_out_colour(&self, duration_secs: f64) -> JoinHandle<()> {
        let colour = self
            .status_colour()
            .unwrap_or_else(|| *self.state.last_colour.lock().unwrap());
        *self.state.last_colour.lock().unwrap() = colour;
        self.spawn_colour(colour, [colour[0], colour[1], 0], duration_secs)
    }

    /// Fade from the last known colour to the given HSV endpoint.
    pub fn transition_colour(&self, end: [i64; 3], duration_secs: f64) -> JoinHandle<()> {
        let start = *self.state.last_colour.lock().unwrap();
        self.spawn_colour(start, end, duration_secs)
    }

    fn spawn_white(&self, start: [i64; 2], end: [i64; 2], duration_secs: f64) -> JoinHandle<()> {
        let light = self.clone();
        tokio::spawn(async move { light.white_transition(start, end, duration_secs).await })
    }

    fn spawn_colour(&self, start: [i64; 3], end: [i64; 3], duration_secs: f64) -> JoinHandle<()> {
        let light = self.clone();
        tokio::spawn(async move { light.colour_transition(start, end, duration_secs).await })
    }

    async fn white_transition(self, start: [i64; 2], end: [i64; 2], duration_secs: f64) {
        tracing::debug!(device_id = %self.session.device_id(), ?start, ?end, duration_secs, "white transition");
        let steps = (duration_secs * 5.0).round() as i64;
        if start == end || steps <= 0 {
            if end[0] <= MIN_BRIGHTNESS {
                self.off();
            } else {
                self.set_white(end[0], end[1]);
            }
            return;
        }

        if !self.acquire_transition().await {
            return;
        }

        for x in 0..=steps {
            if self.interrupted() {
                self.release_transition();
                return;
            }
            let brightness = start[0] + interpolate(end[0] - start[0], x, steps);
            let kelvin = start[1] + interpolate(end[1] - start[1], x, steps);
            self.set_white(brightness, kelvin);
            tokio::time::sleep(STEP_INTERVAL).await;
        }

        self.set_white(end[0], end[1]);
        if end[0] <= MIN_BRIGHTNESS {
            self.off();
        }
        self.release_transition();
    }

    async fn colour_transition(self, start: [i64; 3], end: [i64; 3], duration_secs: f64) {
        tracing::debug!(device_id = %self.session.device_id(), ?start, ?end, duration_secs, "colour transition");
        let steps = (duration_secs * 5.0).round() as i64;
        if start == end || steps <= 0 {
            if start != end {
                self.set_colour(end);
            }
            if end[2] <= 0 {
                self.off();
            }
            return;
        }

        if !self.acquire_transition().await {
            return;
        }

        // Step the hue the short way around the wheel.
        let hdelta = if start[0] > end[0] {
            if start[0] - end[0] < 180 {
                interpolate(end[0] - start[0], 1, steps)
            } else {
                interpolate(end[0] - start[0] + 360, 1, steps)
            }
        } else if end[0] - start[0] < 180 {
            interpolate(end[0] - start[0], 1, steps)
        } else {
            -interpolate(start[0] - end[0] + 360, 1, steps)
        };

        for x in 0..steps {
            if self.interrupted() {
                self.release_transition();
                return;
            }
            let h = (start[0] + hdelta * x).rem_euclid(360);
            let s = start[1] + interpolate(end[1] - start[1], x, steps);
            let v = start[2] + interpolate(end[2] - start[2], x, steps);
            self.set_colour([h, s, v]);
            tokio::time::sleep(STEP_INTERVAL).await;
        }

        self.set_colour(end);
        if end[2] <= 1 {
            self.off();
        }
        self.release_transition();
    }

    /// Claim the bulb's single transition slot. A running transition is asked
    /// to cancel and given up to three 100 ms polls to release; if it does
    /// not, the new transition is dropped silently.
    async fn acquire_transition(&self) -> bool {
        {
            let mut state = self.state.transition.lock().unwrap();
            match *state {
                TransitionState::Idle => {
                    *state = TransitionState::Running;
                    return true;
                }
                TransitionState::Running => *state = TransitionState::CancelRequested,
                TransitionState::CancelRequested => return false,
            }
        }
        for _ in 0..CANCEL_POLLS {
            tokio::time::sleep(CANCEL_POLL).await;
            let mut state = self.state.transition.lock().unwrap();
            if *state == TransitionState::Idle {
                *state = TransitionState::Running;
                return true;
            }
        }
        false
    }

    fn interrupted(&self) -> bool {
        *self.state.transition.lock().unwrap() == TransitionState::CancelRequested
            || !self.session.is_connected()
    }

    fn release_transition(&self) {
        *self.state.transition.lock().unwrap() = TransitionState::Idle;
    }

    // -- Status helpers --

    fn status_str(&self, name: &str) -> Option<String> {
        self.session
            .status_value(name)
            .and_then(|v| v.as_str().map(str::to_owned))
    }

    fn status_i64(&self, name: &str) -> Option<i64> {
        self.session.status_value(name).and_then(|v| v.as_i64())
    }

    fn status_colour(&self) -> Option<[i64; 3]> {
        let value = self.session.status_value("colour")?;
        let parts = value.as_array()?;
        if parts.len() != 3 {
            return None;
        }
        Some([
            parts[0].as_i64()?,
            parts[1].as_i64()?,
            parts[2].as_i64()?,
        ])
    }
}

fn interpolate(span: i64, step: i64, steps: i64) -> i64 {
    ((span * step) as f64 / steps as f64).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn red_encodes_with_full_saturation_and_value() {
        assert_eq!(hsv_to_tuya([0, 100, 100]), "ff00000000ffff");
    }

    #[test]
    fn green_hue_scales_to_55() {
        assert_eq!(hsv_to_tuya([120, 100, 100]), "00ff000055ffff");
    }

    #[test]
    fn blue_roundtrips_through_the_wire_encoding() {
        let wire = hsv_to_tuya([240, 100, 100]);
        assert_eq!(&wire[..8], "0000ff00");
        assert_eq!(tuya_to_hsv(&wire), Some([240, 100, 100]));
    }

    #[test]
    fn hsv_decode_uses_only_the_tail() {
        assert_eq!(tuya_to_hsv("ff00000000ffff"), Some([0, 100, 100]));
        // RGB head is ignored entirely
        assert_eq!(tuya_to_hsv("deadbe0000ffff"), Some([0, 100, 100]));
        assert_eq!(tuya_to_hsv("short"), None);
        assert_eq!(tuya_to_hsv("zz00000000zzzz"), None);
    }

    #[test]
    fn rgb_encoding_keeps_the_head_verbatim() {
        let wire = rgb_to_tuya([255, 0, 0]);
        assert_eq!(&wire[..8], "ff000000");
        assert_eq!(tuya_to_rgb(&wire), Some([255, 0, 0]));
    }

    #[test]
    fn grey_has_zero_saturation() {
        let wire = rgb_to_tuya([128, 128, 128]);
        assert_eq!(&wire[8..12], "0000");
    }

    #[test]
    fn kelvin_scale_endpoints() {
        assert_eq!(kelvin_to_dps(2000), 0);
        assert_eq!(kelvin_to_dps(9000), 255);
        assert_eq!(kelvin_to_dps(5500), 128);
        // out of range clamps
        assert_eq!(kelvin_to_dps(1200), 0);
        assert_eq!(kelvin_to_dps(12000), 255);
    }

    #[test]
    fn dps_to_kelvin_inverts_within_a_step() {
        assert_eq!(dps_to_kelvin(0), 2000);
        assert_eq!(dps_to_kelvin(255), 9000);
        let roundtrip = dps_to_kelvin(kelvin_to_dps(5500));
        assert!((roundtrip - 5500).abs() <= 14, "got {roundtrip}");
    }

    #[test]
    fn interpolation_hits_exact_endpoints() {
        assert_eq!(interpolate(100, 0, 5), 0);
        assert_eq!(interpolate(100, 5, 5), 100);
        assert_eq!(interpolate(-175, 5, 5), -175);
    }
}
