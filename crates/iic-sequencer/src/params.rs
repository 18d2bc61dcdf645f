//! Request parameters and their validation.
//!
//! Front ends hand the builder a flat `key=value` map. Every accessor here
//! returns [`SequenceError::InvalidParams`] naming the offending key, so a
//! rejected request always tells the operator which parameter to fix.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use iic_core::error::{SeqResult, SequenceError};
use iic_core::resource::ResourceName;

/// Number of detector rows; windows must fit inside.
pub const DETECTOR_ROWS: u32 = 4300;

/// Calibration lamps wired to the calibration unit.
pub const LAMPS: [&str; 7] = ["halogen", "argon", "neon", "krypton", "xenon", "hgar", "hgcd"];

/// Longest time, in seconds, any exposure, lamp or warm-up may request.
pub const MAX_SECONDS: f64 = 86_400.0;

/// Largest repeat count (`nExposures`, `nPositions`, iteration caps).
pub const MAX_COUNT: u32 = 1_000;

const ARMS: [char; 4] = ['b', 'r', 'n', 'm'];
const MAX_SPEC_NUM: u8 = 4;

/// Flat map of request parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationParams(BTreeMap<String, String>);

impl OperationParams {
    /// Empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds parameters from `(key, value)` pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Sets a parameter.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Raw value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Required string value.
    pub fn require(&self, key: &str) -> SeqResult<&str> {
        self.get(key)
            .ok_or_else(|| SequenceError::invalid_param(key, "missing required parameter"))
    }

    /// Optional finite float.
    pub fn f64_opt(&self, key: &str) -> SeqResult<Option<f64>> {
        self.get(key).map(|raw| parse_f64(key, raw)).transpose()
    }

    /// Required finite float.
    pub fn require_f64(&self, key: &str) -> SeqResult<f64> {
        parse_f64(key, self.require(key)?)
    }

    /// Float with a default.
    pub fn f64_or(&self, key: &str, default: f64) -> SeqResult<f64> {
        Ok(self.f64_opt(key)?.unwrap_or(default))
    }

    /// Required strictly positive float.
    pub fn require_positive(&self, key: &str) -> SeqResult<f64> {
        let value = self.require_f64(key)?;
        if value <= 0.0 {
            return Err(SequenceError::invalid_param(key, "must be > 0"));
        }
        Ok(value)
    }

    /// Non-negative float with a default.
    pub fn non_negative_or(&self, key: &str, default: f64) -> SeqResult<f64> {
        let value = self.f64_or(key, default)?;
        if value < 0.0 {
            return Err(SequenceError::invalid_param(key, "must be >= 0"));
        }
        Ok(value)
    }

    /// Required exposure-like time in seconds, in `(0, MAX_SECONDS]`.
    pub fn require_seconds(&self, key: &str) -> SeqResult<f64> {
        let value = self.require_positive(key)?;
        check_seconds(key, value)
    }

    /// Time in seconds with a default, in `[0, MAX_SECONDS]`.
    pub fn seconds_or(&self, key: &str, default: f64) -> SeqResult<f64> {
        let value = self.non_negative_or(key, default)?;
        check_seconds(key, value)
    }

    /// Count with a default; must be in `min..=MAX_COUNT`.
    pub fn count_or(&self, key: &str, default: u32, min: u32) -> SeqResult<u32> {
        let value = match self.get(key) {
            None => default,
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
                SequenceError::invalid_param(key, format!("'{raw}' is not a non-negative integer"))
            })?,
        };
        if value < min {
            return Err(SequenceError::invalid_param(key, format!("must be >= {min}")));
        }
        if value > MAX_COUNT {
            return Err(SequenceError::invalid_param(key, format!("must be <= {MAX_COUNT}")));
        }
        Ok(value)
    }

    /// Cameras listed in `cams`, e.g. `b1,r1`. Duplicates are rejected.
    pub fn cameras(&self) -> SeqResult<Vec<Camera>> {
        let raw = self.require("cams")?;
        let mut cams: Vec<Camera> = Vec::new();
        for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let cam: Camera = item
                .parse()
                .map_err(|reason: String| SequenceError::invalid_param("cams", reason))?;
            if cams.contains(&cam) {
                return Err(SequenceError::invalid_param(
                    "cams",
                    format!("camera '{cam}' listed twice"),
                ));
            }
            cams.push(cam);
        }
        if cams.is_empty() {
            return Err(SequenceError::invalid_param("cams", "no camera given"));
        }
        Ok(cams)
    }

    /// Lamp exposure times in seconds, in the order of [`LAMPS`].
    pub fn lamp_times(&self) -> SeqResult<Vec<(&'static str, f64)>> {
        let mut lamps = Vec::new();
        for lamp in LAMPS {
            if let Some(secs) = self.f64_opt(lamp)? {
                if secs <= 0.0 {
                    return Err(SequenceError::invalid_param(lamp, "lamp time must be > 0"));
                }
                lamps.push((lamp, check_seconds(lamp, secs)?));
            }
        }
        Ok(lamps)
    }

    /// `start,stop,num` range expanded into `num` evenly spaced values.
    pub fn linspace(&self, key: &str) -> SeqResult<Vec<f64>> {
        let (start, stop, num) = self.range(key)?;
        Ok(linspace(start, stop, num))
    }

    /// Raw `start,stop,num` range; `num` is in `1..=MAX_COUNT`.
    pub fn range(&self, key: &str) -> SeqResult<(f64, f64, u32)> {
        let raw = self.require(key)?;
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        let [start, stop, num] = parts.as_slice() else {
            return Err(SequenceError::invalid_param(key, "expected 'start,stop,num'"));
        };
        let start = parse_f64(key, start)?;
        let stop = parse_f64(key, stop)?;
        let num: u32 = num
            .parse()
            .map_err(|_| SequenceError::invalid_param(key, "num must be a positive integer"))?;
        if num == 0 || num > MAX_COUNT {
            return Err(SequenceError::invalid_param(
                key,
                format!("num must be in 1..={MAX_COUNT}"),
            ));
        }
        Ok((start, stop, num))
    }

    /// Exactly `N` comma-separated floats, or `None` when `key` is absent.
    pub fn floats<const N: usize>(&self, key: &str) -> SeqResult<Option<[f64; N]>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        let values = raw
            .split(',')
            .map(|part| parse_f64(key, part))
            .collect::<SeqResult<Vec<f64>>>()?;
        values
            .try_into()
            .map(Some)
            .map_err(|_| SequenceError::invalid_param(key, format!("expected {N} comma-separated values")))
    }

    /// Detector window `row0,nrows`.
    pub fn window(&self) -> SeqResult<Window> {
        let raw = self.require("window")?;
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        let [row0, nrows] = parts.as_slice() else {
            return Err(SequenceError::invalid_param("window", "expected 'row0,nrows'"));
        };
        let parse = |s: &str| {
            s.parse::<u32>()
                .map_err(|_| SequenceError::invalid_param("window", format!("'{s}' is not a row number")))
        };
        let window = Window {
            row0: parse(*row0)?,
            nrows: parse(*nrows)?,
        };
        if window.nrows == 0 {
            return Err(SequenceError::invalid_param("window", "nrows must be > 0"));
        }
        if window.row0.saturating_add(window.nrows) > DETECTOR_ROWS {
            return Err(SequenceError::invalid_param(
                "window",
                format!("window exceeds {DETECTOR_ROWS} detector rows"),
            ));
        }
        Ok(window)
    }

    /// Iterates `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Parses whitespace-separated `key=value` tokens, e.g. `exptime=30 cams=b1`.
impl FromStr for OperationParams {
    type Err = SequenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut params = OperationParams::new();
        for token in s.split_whitespace() {
            let (key, value) = token.split_once('=').ok_or_else(|| {
                SequenceError::invalid_param(token, "expected key=value")
            })?;
            if key.is_empty() {
                return Err(SequenceError::invalid_param(token, "empty key"));
            }
            params.0.insert(key.to_string(), value.to_string());
        }
        Ok(params)
    }
}

fn parse_f64(key: &str, raw: &str) -> SeqResult<f64> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| SequenceError::invalid_param(key, format!("'{raw}' is not a number")))?;
    if !value.is_finite() {
        return Err(SequenceError::invalid_param(
            key,
            "must be a finite number (not NaN or infinity)",
        ));
    }
    Ok(value)
}

fn check_seconds(key: &str, value: f64) -> SeqResult<f64> {
    if value > MAX_SECONDS {
        return Err(SequenceError::invalid_param(
            key,
            format!("{value}s exceeds the {MAX_SECONDS}s limit"),
        ));
    }
    Ok(value)
}

/// `base` plus `secs` seconds. Saturates instead of overflowing.
pub fn seconds_after(base: std::time::Duration, secs: f64) -> std::time::Duration {
    match std::time::Duration::try_from_secs_f64(secs) {
        Ok(extra) => base.saturating_add(extra),
        Err(_) if secs > 0.0 => std::time::Duration::MAX,
        Err(_) => base,
    }
}

/// `num` evenly spaced values from `start` to `stop`, rounded to 0.01.
pub fn linspace(start: f64, stop: f64, num: u32) -> Vec<f64> {
    if num <= 1 {
        return vec![round2(start)];
    }
    let step = (stop - start) / f64::from(num - 1);
    (0..num).map(|i| round2(start + step * f64::from(i))).collect()
}

/// Rounds to two decimals, the resolution of slit and focus positions.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// One spectrograph camera, e.g. `b1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Camera {
    /// Arm letter: `b`, `r`, `n` or `m`.
    pub arm: char,
    /// Spectrograph module, 1 to 4.
    pub spec_num: u8,
}

impl Camera {
    /// Camera resource, e.g. `arm:b1`.
    pub fn resource(&self) -> ResourceName {
        ResourceName::arm(&self.to_string())
    }
}

impl fmt::Display for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.arm, self.spec_num)
    }
}

impl FromStr for Camera {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let arm = chars.next().ok_or_else(|| "empty camera name".to_string())?;
        if !ARMS.contains(&arm) {
            return Err(format!("unknown arm '{arm}' in '{s}'"));
        }
        let spec_num: u8 = chars
            .as_str()
            .parse()
            .map_err(|_| format!("invalid spectrograph number in '{s}'"))?;
        if spec_num == 0 || spec_num > MAX_SPEC_NUM {
            return Err(format!("spectrograph number out of range in '{s}'"));
        }
        Ok(Camera { arm, spec_num })
    }
}

/// Spectrograph modules touched by `cams`, sorted and deduplicated.
pub fn spec_modules(cams: &[Camera]) -> Vec<u8> {
    let mut specs: Vec<u8> = cams.iter().map(|c| c.spec_num).collect();
    specs.sort_unstable();
    specs.dedup();
    specs
}

/// Windowed detector readout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// First row.
    pub row0: u32,
    /// Number of rows.
    pub nrows: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(s: &str) -> OperationParams {
        s.parse().unwrap()
    }

    #[test]
    fn parse_key_values() {
        let p = params("exptime=30 nExposures=3 cams=b1,r1");
        assert_eq!(p.get("exptime"), Some("30"));
        assert!("exptime".parse::<OperationParams>().is_err());
    }

    #[test]
    fn numbers_are_validated_by_name() {
        let p = params("exptime=abc");
        let err = p.require_f64("exptime").unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "exptime"));

        let err = params("exptime=NaN").require_f64("exptime").unwrap_err();
        assert!(err.to_string().contains("finite"));

        let err = params("exptime=-1").require_positive("exptime").unwrap_err();
        assert!(err.to_string().contains("> 0"));

        let err = OperationParams::new().require_f64("exptime").unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn counts_respect_minimum() {
        assert_eq!(OperationParams::new().count_or("nExposures", 1, 1).unwrap(), 1);
        assert!(params("nExposures=0").count_or("nExposures", 1, 1).is_err());
        assert!(params("nExposures=2.5").count_or("nExposures", 1, 1).is_err());
        assert!(params("nExposures=10").count_or("nExposures", 15, 15).is_err());
    }

    #[test]
    fn cameras_parse_and_reject_bad_names() {
        let cams = params("cams=b1,r2").cameras().unwrap();
        assert_eq!(cams[1], Camera { arm: 'r', spec_num: 2 });
        assert_eq!(cams[0].resource().as_str(), "arm:b1");

        for bad in ["cams=x1", "cams=b9", "cams=b", "cams=b1,b1", "cams="] {
            let err = params(bad).cameras().unwrap_err();
            assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "cams"), "{bad}");
        }
    }

    #[test]
    fn linspace_matches_endpoints() {
        let values = params("focusRange=-6,6,5").linspace("focusRange").unwrap();
        assert_eq!(values, vec![-6.0, -3.0, 0.0, 3.0, 6.0]);
        assert_eq!(
            params("r=1.234,9,1").linspace("r").unwrap(),
            vec![1.23]
        );
        assert!(params("r=1,2").linspace("r").is_err());
        assert!(params("r=1,2,0").linspace("r").is_err());
    }

    #[test]
    fn fixed_length_float_lists() {
        assert_eq!(params("tilt=0,10,-5").floats::<3>("tilt").unwrap(), Some([0.0, 10.0, -5.0]));
        assert_eq!(params("").floats::<3>("tilt").unwrap(), None);
        let err = params("tilt=1,2").floats::<3>("tilt").unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "tilt"));
    }

    #[test]
    fn window_bounds() {
        assert_eq!(
            params("window=100,200").window().unwrap(),
            Window { row0: 100, nrows: 200 }
        );
        assert!(params("window=100,0").window().is_err());
        assert!(params("window=4200,200").window().is_err());
        assert!(params("window=100").window().is_err());
    }

    #[test]
    fn lamp_times_in_fixed_order() {
        let lamps = params("neon=3 argon=5").lamp_times().unwrap();
        assert_eq!(lamps, vec![("argon", 5.0), ("neon", 3.0)]);
        assert!(params("argon=0").lamp_times().is_err());
    }

    #[test]
    fn huge_times_are_rejected_by_name() {
        for raw in ["1e300", "1.9e19", "86401"] {
            let err = params(&format!("exptime={raw}"))
                .require_seconds("exptime")
                .unwrap_err();
            assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "exptime"), "{raw}");
        }
        assert_eq!(params("exptime=86400").require_seconds("exptime").unwrap(), 86_400.0);

        let err = params("warmingTime=1e300").seconds_or("warmingTime", 0.0).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "warmingTime"));

        let err = params("xenon=1e30").lamp_times().unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "xenon"));
    }

    #[test]
    fn counts_are_capped() {
        let err = params("nExposures=4000000000")
            .count_or("nExposures", 1, 1)
            .unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "nExposures"));
        assert_eq!(params("nExposures=1000").count_or("nExposures", 1, 1).unwrap(), MAX_COUNT);
        assert!(params("focusRange=0,1,5000").linspace("focusRange").is_err());
    }

    #[test]
    fn seconds_after_saturates() {
        use std::time::Duration;
        let base = Duration::from_secs(120);
        assert_eq!(seconds_after(base, 30.0), Duration::from_secs(150));
        assert_eq!(seconds_after(base, 1e300), Duration::MAX);
        assert_eq!(seconds_after(base, f64::NAN), base);
    }
}
