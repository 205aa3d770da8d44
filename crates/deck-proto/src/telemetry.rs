use serde::{Deserialize, Serialize};

/// Link-level connection change reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub is_connected: bool,
}

/// Raw position sample as the transport delivers it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub rel_alt_m: f32,
}

/// Raw attitude sample, radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttitudeEuler {
    pub roll_rad: f32,
    pub pitch_rad: f32,
    pub yaw_rad: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryUpdate {
    /// 0.0 ..= 1.0
    pub remaining_fraction: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpsInfo {
    /// 0..=6, see [`GpsFixLevel`]
    pub fix_type: u8,
    pub num_satellites: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub relative_altitude_m: f32,
}

impl From<PositionUpdate> for Position {
    fn from(p: PositionUpdate) -> Self {
        Self { latitude_deg: p.lat_deg, longitude_deg: p.lon_deg, relative_altitude_m: p.rel_alt_m }
    }
}

/// Attitude in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Attitude {
    pub roll_deg: f32,
    pub pitch_deg: f32,
    pub yaw_deg: f32,
}

impl From<AttitudeEuler> for Attitude {
    fn from(a: AttitudeEuler) -> Self {
        Self {
            roll_deg: a.roll_rad.to_degrees(),
            pitch_deg: a.pitch_rad.to_degrees(),
            yaw_deg: a.yaw_rad.to_degrees(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GpsFixLevel {
    #[default]
    None = 0,
    NoFix = 1,
    Fix2D = 2,
    Fix3D = 3,
    Dgps = 4,
    RtkFloat = 5,
    RtkFixed = 6,
}

/// Coarse grading of a fix level, as shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpsQuality {
    Good,
    Weak,
    None,
}

impl GpsFixLevel {
    pub fn from_raw(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::None,
            1 => Self::NoFix,
            2 => Self::Fix2D,
            3 => Self::Fix3D,
            4 => Self::Dgps,
            5 => Self::RtkFloat,
            6 => Self::RtkFixed,
            _ => return None,
        })
    }

    pub fn quality(self) -> GpsQuality {
        match self {
            Self::Fix3D | Self::Dgps | Self::RtkFloat | Self::RtkFixed => GpsQuality::Good,
            Self::Fix2D => GpsQuality::Weak,
            Self::None | Self::NoFix => GpsQuality::None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "No GPS",
            Self::NoFix => "No Fix",
            Self::Fix2D => "2D Fix",
            Self::Fix3D => "3D Fix",
            Self::Dgps => "DGPS",
            Self::RtkFloat => "RTK Float",
            Self::RtkFixed => "RTK Fixed",
        }
    }
}

/// Process-wide vehicle snapshot.
///
/// Fields are written independently as their topics arrive, so a snapshot may
/// mix values from different instants. Once `connected` drops to false the
/// remaining fields are stale and kept only for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub connected: bool,
    pub armed: bool,
    pub in_air: bool,
    pub position: Position,
    pub attitude: Attitude,
    /// 0.0 ..= 100.0
    pub battery_percent: f32,
    pub gps_fix: GpsFixLevel,
    pub satellites: i32,
    /// Unix ms of the most recent field write, 0 before the first.
    pub updated_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gps_quality_covers_every_level() {
        let expected = [
            (0, GpsQuality::None),
            (1, GpsQuality::None),
            (2, GpsQuality::Weak),
            (3, GpsQuality::Good),
            (4, GpsQuality::Good),
            (5, GpsQuality::Good),
            (6, GpsQuality::Good),
        ];
        for (raw, quality) in expected {
            let level = GpsFixLevel::from_raw(raw).unwrap();
            assert_eq!(level as u8, raw);
            assert_eq!(level.quality(), quality, "fix type {}", raw);
        }
        assert_eq!(GpsFixLevel::from_raw(7), None);
    }

    #[test]
    fn attitude_converts_to_degrees() {
        let a = Attitude::from(AttitudeEuler {
            roll_rad: std::f32::consts::FRAC_PI_2,
            pitch_rad: 0.0,
            yaw_rad: -std::f32::consts::PI,
        });
        assert!((a.roll_deg - 90.0).abs() < 1e-4);
        assert_eq!(a.pitch_deg, 0.0);
        assert!((a.yaw_deg + 180.0).abs() < 1e-4);
    }
}
