//! Linear host volume to renderer volume mapping.
//!
//! A curve is written as `"threshold:value, threshold:value, …"`, e.g. the
//! default `"0:0, 400:10, …, 65536:100"`. Thresholds are host volume units
//! and must be strictly ascending; values are renderer volume units and must
//! never decrease. Past the last breakpoint the output stays at the last
//! value.

use std::fmt;
use std::str::FromStr;

use crate::errors::BridgeError;

pub const DEFAULT_VOLUME_CURVE: &str =
    "0:0, 400:10, 700:20, 1200:30, 2050:40, 3800:50, 6600:60, 12000:70, 21000:80, 37000:90, 65536:100";

/// Fixed-point scale used while interpolating.
const SCALE: i128 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub threshold: u32,
    pub value: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeCurve {
    /// Sorted breakpoints, terminated by the sentinel.
    points: Vec<Breakpoint>,
    /// Number of breakpoints that came from the curve string.
    defined: usize,
}

impl VolumeCurve {
    pub fn parse(spec: &str) -> Result<Self, BridgeError> {
        let mut points: Vec<Breakpoint> = Vec::new();

        for raw in spec.split(',') {
            let entry = raw.trim();
            if entry.is_empty() {
                return Err(BridgeError::config(format!(
                    "volume curve '{spec}' has an empty entry"
                )));
            }

            let (threshold, value) = entry.split_once(':').ok_or_else(|| {
                BridgeError::config(format!("volume curve entry '{entry}' is not threshold:value"))
            })?;
            let threshold = parse_number(threshold, entry)?;
            let value = parse_number(value, entry)?;

            if let Some(prev) = points.last() {
                if threshold <= prev.threshold {
                    return Err(BridgeError::config(format!(
                        "volume curve thresholds must be strictly ascending ({} then {})",
                        prev.threshold, threshold
                    )));
                }
                if value < prev.value {
                    return Err(BridgeError::config(format!(
                        "volume curve values must not decrease ({} then {})",
                        prev.value, value
                    )));
                }
            }

            points.push(Breakpoint { threshold, value });
        }

        let last = *points
            .last()
            .ok_or_else(|| BridgeError::config("volume curve is empty"))?;
        let defined = points.len();
        if last.threshold < u32::MAX {
            points.push(Breakpoint {
                threshold: u32::MAX,
                value: last.value,
            });
        }

        Ok(Self { points, defined })
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.points
    }

    /// Maps a host volume onto the renderer scale.
    pub fn map(&self, input: u32) -> u32 {
        let Some(index) = self.points.iter().position(|p| p.threshold > input) else {
            // Only reachable with input == u32::MAX: sits on the sentinel.
            return self.points.last().map(|p| p.value).unwrap_or(0);
        };

        let (a1, b1) = match index {
            0 => (0i128, 0i128),
            i => {
                let prev = self.points[i - 1];
                (prev.threshold as i128, prev.value as i128)
            }
        };
        let a2 = self.points[index].threshold as i128;
        let b2 = self.points[index].value as i128;

        if a2 == a1 {
            return 0;
        }

        let x = input as i128;
        let scaled = b1 * SCALE + ((x - a1) * (b2 - b1) * SCALE) / (a2 - a1);
        (scaled / SCALE) as u32
    }
}

impl Default for VolumeCurve {
    fn default() -> Self {
        // The built-in curve is known to be well formed.
        Self::parse(DEFAULT_VOLUME_CURVE).unwrap_or_else(|_| Self {
            points: vec![Breakpoint {
                threshold: u32::MAX,
                value: 100,
            }],
            defined: 1,
        })
    }
}

impl FromStr for VolumeCurve {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VolumeCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .points
            .iter()
            .take(self.defined)
            .map(|p| format!("{}:{}", p.threshold, p.value))
            .collect();
        write!(f, "{}", rendered.join(", "))
    }
}

fn parse_number(text: &str, entry: &str) -> Result<u32, BridgeError> {
    text.trim()
        .parse::<u32>()
        .map_err(|_| BridgeError::config(format!("volume curve entry '{entry}' is not numeric")))
}
