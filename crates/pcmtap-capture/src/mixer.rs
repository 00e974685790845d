//! Hardware volume mapping.
//!
//! Translates between the server's normalized volume scale and the raw
//! integer range a mixer element reports. Device discovery and the mixer
//! event plumbing live outside the engine; what matters here is the
//! mapping itself and the decision whether hardware volume control is
//! usable at all.

/// Normalized full volume (0 dB).
pub const VOLUME_NORM: u32 = 0x10000;

/// Per-channel virtual volume, normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLevels {
    pub values: Vec<u32>,
}

impl VolumeLevels {
    pub fn norm(channels: usize) -> Self {
        Self {
            values: vec![VOLUME_NORM; channels],
        }
    }

    pub fn muted(channels: usize) -> Self {
        Self {
            values: vec![0; channels],
        }
    }

    pub fn max(&self) -> u32 {
        self.values.iter().copied().max().unwrap_or(0)
    }
}

/// Raw integer range reported by the mixer element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeRange {
    pub min: i64,
    pub max: i64,
}

impl VolumeRange {
    pub fn span(&self) -> i64 {
        self.max - self.min
    }

    pub fn to_raw(&self, vol: u32) -> i64 {
        let raw =
            (vol as f64 * self.span() as f64 / VOLUME_NORM as f64).round() as i64 + self.min;
        raw.clamp(self.min, self.max)
    }

    pub fn from_raw(&self, raw: i64) -> u32 {
        ((raw - self.min) as f64 * VOLUME_NORM as f64 / self.span() as f64).round() as u32
    }
}

/// dB range in centi-dB, as mixer elements report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRange {
    pub min_cdb: i64,
    pub max_cdb: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeScale {
    /// Hardware control with a proper dB scale.
    Decibel { range: VolumeRange, db: DbRange },
    /// Hardware control over raw steps only.
    Raw(VolumeRange),
    /// Hardware control declined; volume is applied in software.
    Software,
}

/// Decide how volume will be controlled for this device.
///
/// A range of fewer than 4 levels is useless as a hardware control; a
/// non-increasing range means the kernel driver is lying.
pub fn select_volume_scale(
    range: Option<VolumeRange>,
    db: Option<DbRange>,
    ignore_db: bool,
) -> VolumeScale {
    let Some(range) = range else {
        return VolumeScale::Software;
    };

    if range.min >= range.max {
        tracing::warn!(
            min = range.min,
            max = range.max,
            "mixer reports a nonsensical volume range, using software volume"
        );
        return VolumeScale::Software;
    }

    let db = if ignore_db {
        None
    } else {
        db.filter(|d| {
            if d.min_cdb >= d.max_cdb {
                tracing::warn!(
                    min_cdb = d.min_cdb,
                    max_cdb = d.max_cdb,
                    "mixer reports a nonsensical dB range, ignoring it"
                );
                false
            } else {
                true
            }
        })
    };

    if let Some(db) = db {
        return VolumeScale::Decibel { range, db };
    }

    if range.span() < 3 {
        tracing::info!("device has fewer than 4 volume levels, using software volume");
        return VolumeScale::Software;
    }

    VolumeScale::Raw(range)
}

/// Hook the engine invokes to push the last known virtual volume back to
/// the hardware, in particular after an unsuspend renegotiation.
pub trait VolumeControl: Send {
    fn apply(&mut self, levels: &VolumeLevels);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_mapping_round_trips_within_one_step() {
        let range = VolumeRange { min: -20, max: 30 };
        for vol in (0..=VOLUME_NORM).step_by(997) {
            let raw = range.to_raw(vol);
            assert!((range.min..=range.max).contains(&raw));
            let back = range.from_raw(raw);
            let step = VOLUME_NORM as i64 / range.span();
            assert!(
                (back as i64 - vol as i64).abs() <= step,
                "vol {vol} -> raw {raw} -> {back}"
            );
        }
    }

    #[test]
    fn endpoints_map_exactly() {
        let range = VolumeRange { min: 0, max: 63 };
        assert_eq!(range.to_raw(0), 0);
        assert_eq!(range.to_raw(VOLUME_NORM), 63);
        assert_eq!(range.from_raw(0), 0);
        assert_eq!(range.from_raw(63), VOLUME_NORM);
    }

    #[test]
    fn narrow_range_declines_hardware_control() {
        let range = VolumeRange { min: 0, max: 2 };
        assert_eq!(select_volume_scale(Some(range), None, false), VolumeScale::Software);
    }

    #[test]
    fn broken_range_declines_hardware_control() {
        let range = VolumeRange { min: 10, max: 10 };
        assert_eq!(select_volume_scale(Some(range), None, false), VolumeScale::Software);
    }

    #[test]
    fn db_scale_survives_a_narrow_raw_range() {
        let range = VolumeRange { min: 0, max: 2 };
        let db = DbRange {
            min_cdb: -3000,
            max_cdb: 0,
        };
        assert!(matches!(
            select_volume_scale(Some(range), Some(db), false),
            VolumeScale::Decibel { .. }
        ));
    }

    #[test]
    fn ignore_db_falls_back_to_raw_steps() {
        let range = VolumeRange { min: 0, max: 63 };
        let db = DbRange {
            min_cdb: -3000,
            max_cdb: 0,
        };
        assert_eq!(
            select_volume_scale(Some(range), Some(db), true),
            VolumeScale::Raw(range)
        );
    }

    #[test]
    fn volume_levels_helpers() {
        let v = VolumeLevels::norm(2);
        assert_eq!(v.max(), VOLUME_NORM);
        assert_eq!(VolumeLevels::muted(2).max(), 0);
    }
}
