//! Settings grammar.
//!
//! A `key=value` write is matched against an ordered table of key
//! patterns; the first pattern whose shape matches the key decides how the
//! value is parsed. Exact global keys come before the interface-suffix
//! patterns so `pollInterval.msec` can never be read as an interface named
//! `pollInterval` with an `msec` attribute.

use crate::error::SettingError;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const POLL_INTERVAL: &str = "pollInterval";
pub const FAST_POLL_INTERVAL: &str = "pollInterval.msec";
pub const UNRESOLVED_ARP_INTERVAL: &str = "unresolved-arpInterval";
pub const HF_BROKER: &str = "hf-broker";
/// Reserved one-way broadcast key.
pub const READY: &str = "ready";

/// Longest accepted poll or probe period.
pub const MAX_INTERVAL: Duration = Duration::from_secs(86_400);

/// Whether `value`, counted in units of which `per_second` make a second,
/// lies within one unit and [`MAX_INTERVAL`]. NaN and infinities are out
/// of range.
pub fn interval_in_range(value: f64, per_second: f64) -> bool {
    value >= 1.0
        && Duration::try_from_secs_f64(value / per_second).is_ok_and(|d| d <= MAX_INTERVAL)
}

/// Interface bandwidth in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bandwidth {
    Auto,
    Bps(u64),
}

const UNITS: [(u64, char); 4] = [
    (1_000_000_000_000, 't'),
    (1_000_000_000, 'g'),
    (1_000_000, 'm'),
    (1_000, 'k'),
];

impl Bandwidth {
    pub fn from_mbps(mbps: u32) -> Self {
        if mbps == 0 {
            Bandwidth::Auto
        } else {
            Bandwidth::Bps(u64::from(mbps) * 1_000_000)
        }
    }

    /// Speed in Mbps, 0 for autonegotiated.
    pub fn mbps(self) -> u32 {
        match self {
            Bandwidth::Auto => 0,
            Bandwidth::Bps(bps) => u32::try_from(bps / 1_000_000).unwrap_or(u32::MAX),
        }
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Bandwidth::Auto => f.write_str("auto"),
            Bandwidth::Bps(bps) => {
                for (scale, unit) in UNITS {
                    if bps >= scale && bps % scale == 0 {
                        return write!(f, "{}{}", bps / scale, unit);
                    }
                }
                write!(f, "{}", bps)
            }
        }
    }
}

impl FromStr for Bandwidth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "auto" {
            return Ok(Bandwidth::Auto);
        }
        let (number, scale) = match s.chars().last() {
            Some(c) if c.is_ascii_alphabetic() => {
                let scale = UNITS
                    .iter()
                    .find(|(_, unit)| *unit == c)
                    .map(|(scale, _)| *scale)
                    .ok_or_else(|| format!("unknown bandwidth unit '{}'", c))?;
                (&s[..s.len() - 1], scale)
            }
            _ => (s.as_str(), 1),
        };
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid bandwidth '{}'", s))?;
        if !value.is_finite() || value <= 0.0 {
            return Err(format!("invalid bandwidth '{}'", s));
        }
        Ok(Bandwidth::Bps((value * scale as f64).round() as u64))
    }
}

/// Forward error correction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Fec {
    #[default]
    None,
    Cl74,
    Cl91,
}

impl fmt::Display for Fec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Fec::None => "none",
            Fec::Cl74 => "cl74",
            Fec::Cl91 => "cl91",
        })
    }
}

impl FromStr for Fec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Fec::None),
            "cl74" | "kr" | "fec74" => Ok(Fec::Cl74),
            "cl91" | "rs" | "fec91" => Ok(Fec::Cl91),
            other => Err(format!("unknown fec '{}'", other)),
        }
    }
}

/// Parses an enable token.
pub fn parse_enable(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "up" | "on" | "enable" | "yes" | "1" => Ok(true),
        "false" | "down" | "off" | "disable" | "no" | "0" => Ok(false),
        other => Err(format!("invalid enable '{}'", other)),
    }
}

pub fn format_enable(up: bool) -> &'static str {
    if up {
        "true"
    } else {
        "false"
    }
}

/// Interval echo, six decimals.
pub fn format_interval(value: f64) -> String {
    format!("{:.6}", value)
}

/// A parsed settings write.
#[derive(Debug, Clone, PartialEq)]
pub enum Setting {
    /// Slow poll period in seconds.
    PollInterval(f64),
    /// Fast poll period in milliseconds.
    FastPollInterval(f64),
    /// Unresolved-neighbour probe period in seconds.
    UnresolvedArpInterval(f64),
    HfBroker(String),
    Speed { ifname: String, speed: Bandwidth },
    Admin { ifname: String, up: bool },
    Media { ifname: String, media: String },
    Fec { ifname: String, fec: Fec },
}

type Build = fn(&Captures<'_>, &str, &str) -> Result<Setting, SettingError>;

struct Rule {
    pattern: Regex,
    build: Build,
}

fn rule(pattern: &str, build: Build) -> Rule {
    Rule {
        pattern: Regex::new(pattern).expect("Invalid regex pattern"),
        build,
    }
}

static GRAMMAR: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"^pollInterval\.msec$", |_, key, value| {
            interval(key, value, 1000.0, "must be 1 millisecond or longer")
                .map(Setting::FastPollInterval)
        }),
        rule(r"^pollInterval$", |_, key, value| {
            interval(key, value, 1.0, "must be 1 second or longer").map(Setting::PollInterval)
        }),
        rule(r"^unresolved-arpInterval$", |_, key, value| {
            interval(key, value, 1.0, "must be 1 second or longer")
                .map(Setting::UnresolvedArpInterval)
        }),
        rule(r"^hf-broker$", |_, _, value| Ok(Setting::HfBroker(value.trim().to_string()))),
        rule(r"^(?P<ifname>.+)\.speed$", |caps, key, value| {
            Ok(Setting::Speed {
                ifname: caps["ifname"].to_string(),
                speed: value
                    .parse()
                    .map_err(|e: String| SettingError::validation(key, e))?,
            })
        }),
        rule(r"^(?P<ifname>.+)\.admin$", |caps, key, value| {
            Ok(Setting::Admin {
                ifname: caps["ifname"].to_string(),
                up: parse_enable(value).map_err(|e| SettingError::validation(key, e))?,
            })
        }),
        rule(r"^(?P<ifname>.+)\.media$", |caps, key, value| {
            let media = value.trim();
            if media.is_empty() || media.contains(char::is_whitespace) {
                return Err(SettingError::validation(key, "media must be a single word"));
            }
            Ok(Setting::Media {
                ifname: caps["ifname"].to_string(),
                media: media.to_string(),
            })
        }),
        rule(r"^(?P<ifname>.+)\.fec$", |caps, key, value| {
            Ok(Setting::Fec {
                ifname: caps["ifname"].to_string(),
                fec: value
                    .parse()
                    .map_err(|e: String| SettingError::validation(key, e))?,
            })
        }),
    ]
});

fn interval(key: &str, value: &str, per_second: f64, minimum: &str) -> Result<f64, SettingError> {
    let v: f64 = value
        .trim()
        .parse()
        .map_err(|_| SettingError::validation(key, format!("invalid number '{}'", value)))?;
    if v.is_nan() || v < 1.0 {
        return Err(SettingError::validation(key, minimum));
    }
    if !interval_in_range(v, per_second) {
        return Err(SettingError::validation(key, "must be one day or shorter"));
    }
    Ok(v)
}

impl Setting {
    /// Matches `key` against the grammar and parses `value` accordingly.
    pub fn parse(key: &str, value: &str) -> Result<Setting, SettingError> {
        for rule in GRAMMAR.iter() {
            if let Some(caps) = rule.pattern.captures(key) {
                return (rule.build)(&caps, key, value);
            }
        }
        Err(SettingError::unknown(key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_global_intervals() {
        assert_eq!(Setting::parse("pollInterval", "10").unwrap(), Setting::PollInterval(10.0));
        assert_eq!(
            Setting::parse("pollInterval.msec", "50").unwrap(),
            Setting::FastPollInterval(50.0)
        );
        assert_eq!(
            Setting::parse("unresolved-arpInterval", "2.5").unwrap(),
            Setting::UnresolvedArpInterval(2.5)
        );
    }

    #[test]
    fn test_interval_below_minimum_rejected() {
        let err = Setting::parse("pollInterval", "0.5").unwrap_err();
        assert_eq!(err.to_string(), "pollInterval: must be 1 second or longer");
        assert!(matches!(
            Setting::parse("pollInterval.msec", "0"),
            Err(SettingError::Validation { .. })
        ));
        assert!(matches!(
            Setting::parse("pollInterval", "soon"),
            Err(SettingError::Validation { .. })
        ));
        assert!(matches!(
            Setting::parse("pollInterval", "NaN"),
            Err(SettingError::Validation { .. })
        ));
    }

    #[test]
    fn test_interval_above_maximum_rejected() {
        let err = Setting::parse("pollInterval", "1e300").unwrap_err();
        assert_eq!(err.to_string(), "pollInterval: must be one day or shorter");
        assert!(matches!(
            Setting::parse("pollInterval", "inf"),
            Err(SettingError::Validation { .. })
        ));
        assert!(matches!(
            Setting::parse("unresolved-arpInterval", "1e18"),
            Err(SettingError::Validation { .. })
        ));
        assert!(matches!(
            Setting::parse("pollInterval.msec", "86400001"),
            Err(SettingError::Validation { .. })
        ));
        assert_eq!(
            Setting::parse("pollInterval.msec", "86400000").unwrap(),
            Setting::FastPollInterval(86_400_000.0)
        );
        assert_eq!(
            Setting::parse("pollInterval", "86400").unwrap(),
            Setting::PollInterval(86_400.0)
        );
    }

    #[test]
    fn test_unknown_key() {
        assert_eq!(
            Setting::parse("bogus", "x").unwrap_err(),
            SettingError::unknown("bogus", "x")
        );
        assert!(matches!(
            Setting::parse("xeth1.mtu", "9000"),
            Err(SettingError::UnknownSetting { .. })
        ));
    }

    #[test]
    fn test_interface_settings() {
        assert_eq!(
            Setting::parse("xeth3.speed", "100g").unwrap(),
            Setting::Speed {
                ifname: "xeth3".to_string(),
                speed: Bandwidth::Bps(100_000_000_000),
            }
        );
        assert_eq!(
            Setting::parse("xeth3-2.admin", "down").unwrap(),
            Setting::Admin {
                ifname: "xeth3-2".to_string(),
                up: false,
            }
        );
        assert_eq!(
            Setting::parse("xeth3.100.admin", "up").unwrap(),
            Setting::Admin {
                ifname: "xeth3.100".to_string(),
                up: true,
            }
        );
        assert_eq!(
            Setting::parse("xeth3.media", "copper").unwrap(),
            Setting::Media {
                ifname: "xeth3".to_string(),
                media: "copper".to_string(),
            }
        );
        assert_eq!(
            Setting::parse("xeth3.fec", "rs").unwrap(),
            Setting::Fec {
                ifname: "xeth3".to_string(),
                fec: Fec::Cl91,
            }
        );
    }

    #[test]
    fn test_bad_interface_values() {
        assert!(Setting::parse("xeth1.speed", "fast").is_err());
        assert!(Setting::parse("xeth1.speed", "10x").is_err());
        assert!(Setting::parse("xeth1.admin", "maybe").is_err());
        assert!(Setting::parse("xeth1.fec", "cl108").is_err());
        assert!(Setting::parse("xeth1.media", "").is_err());
    }

    #[test]
    fn test_bandwidth_display_and_parse() {
        assert_eq!("auto".parse::<Bandwidth>().unwrap(), Bandwidth::Auto);
        assert_eq!("25G".parse::<Bandwidth>().unwrap().to_string(), "25g");
        assert_eq!("2.5g".parse::<Bandwidth>().unwrap().to_string(), "2500m");
        assert_eq!("1000".parse::<Bandwidth>().unwrap().to_string(), "1k");
        assert_eq!(Bandwidth::from_mbps(100_000).to_string(), "100g");
        assert_eq!(Bandwidth::from_mbps(100_000).mbps(), 100_000);
        assert_eq!(Bandwidth::Auto.mbps(), 0);
    }

    #[test]
    fn test_enable_tokens() {
        for t in ["true", "UP", "on", "enable", "yes", "1"] {
            assert_eq!(parse_enable(t), Ok(true), "{t}");
        }
        for t in ["false", "down", "Off", "disable", "no", "0"] {
            assert_eq!(parse_enable(t), Ok(false), "{t}");
        }
    }

    #[test]
    fn test_format_interval() {
        assert_eq!(format_interval(10.0), "10.000000");
        assert_eq!(format_interval(2.5), "2.500000");
    }
}
