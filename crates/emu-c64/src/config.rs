//! Machine configuration: model, timing standard, ROM images and the
//! per-subsystem settings that double as runtime resources.
//!
//! Configurations load from JSON. ROM images are plain byte inputs and are
//! never serialized.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::io::CollisionMode;
use crate::memhack::MemHackKind;

/// Machine model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum C64Model {
    #[default]
    C64,
    /// C128 running with its C64-mode memory map, plus the VDC.
    C128,
}

/// Video timing standard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimingStandard {
    /// 6569, 985,248 Hz.
    #[default]
    Pal,
    /// 6567R8, 1,022,727 Hz.
    Ntsc,
    /// 6567R56A, 64 cycles per line.
    NtscOld,
    /// 6572 (Drean), 1,023,440 Hz.
    PalN,
}

/// Derived clock figures for one timing standard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MachineTiming {
    pub cycles_per_sec: u64,
    pub cycles_per_line: u64,
    pub lines_per_frame: u64,
    pub cycles_per_frame: u64,
    pub frames_per_sec: f64,
    /// Mains frequency, which drives the CIA TOD clocks.
    pub power_freq: u32,
}

impl TimingStandard {
    #[must_use]
    pub const fn timing(self) -> MachineTiming {
        let (cycles_per_sec, cycles_per_line, lines_per_frame, power_freq) = match self {
            TimingStandard::Pal => (985_248, 63, 312, 50),
            TimingStandard::Ntsc => (1_022_727, 65, 263, 60),
            TimingStandard::NtscOld => (1_022_730, 64, 262, 60),
            TimingStandard::PalN => (1_023_440, 65, 312, 50),
        };
        let cycles_per_frame = cycles_per_line * lines_per_frame;
        MachineTiming {
            cycles_per_sec,
            cycles_per_line,
            lines_per_frame,
            cycles_per_frame,
            frames_per_sec: cycles_per_sec as f64 / cycles_per_frame as f64,
            power_freq,
        }
    }

    /// Value of the `MachineVideoStandard` resource.
    #[must_use]
    pub const fn resource_value(self) -> i64 {
        match self {
            TimingStandard::Pal => 1,
            TimingStandard::Ntsc => 2,
            TimingStandard::NtscOld => 3,
            TimingStandard::PalN => 4,
        }
    }

    #[must_use]
    pub const fn from_resource_value(v: i64) -> Option<Self> {
        match v {
            1 => Some(TimingStandard::Pal),
            2 => Some(TimingStandard::Ntsc),
            3 => Some(TimingStandard::NtscOld),
            4 => Some(TimingStandard::PalN),
            _ => None,
        }
    }

    /// Standards a model's VIC-II variants exist for.
    #[must_use]
    pub fn supported_by(self, model: C64Model) -> bool {
        match model {
            C64Model::C64 => true,
            C64Model::C128 => matches!(self, TimingStandard::Pal | TimingStandard::Ntsc),
        }
    }
}

/// Datasette tuning, shared by both tape ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetteConfig {
    pub reset_with_cpu: bool,
    /// Cycles used for a zero gap byte.
    pub zero_gap_delay: u32,
    /// Speed offset in 1/100000 (50000 = 50% slow).
    pub speed_tuning: i32,
    pub wobble_frequency: u32,
    pub wobble_amplitude: u32,
    pub azimuth_error: u32,
    /// Accepted for compatibility; no synthesis.
    pub sound: bool,
}

impl Default for DatasetteConfig {
    fn default() -> Self {
        Self {
            reset_with_cpu: true,
            zero_gap_delay: 2500,
            speed_tuning: 0,
            wobble_frequency: 0,
            wobble_amplitude: 0,
            azimuth_error: 0,
            sound: false,
        }
    }
}

impl DatasetteConfig {
    pub const ZERO_GAP_DELAY_MAX: u32 = 50_000;
    pub const SPEED_TUNING_LIMIT: i32 = 50_000;
    pub const WOBBLE_FREQUENCY_MAX: u32 = 5000;
    pub const WOBBLE_AMPLITUDE_MAX: u32 = 5000;
    pub const AZIMUTH_ERROR_MAX: u32 = 25_000;

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("DatasetteZeroGapDelay", self.zero_gap_delay, Self::ZERO_GAP_DELAY_MAX)?;
        if self.speed_tuning.abs() > Self::SPEED_TUNING_LIMIT {
            return Err(ConfigError::invalid("DatasetteSpeedTuning", self.speed_tuning));
        }
        check_range(
            "DatasetteTapeWobbleFrequency",
            self.wobble_frequency,
            Self::WOBBLE_FREQUENCY_MAX,
        )?;
        check_range(
            "DatasetteTapeWobbleAmplitude",
            self.wobble_amplitude,
            Self::WOBBLE_AMPLITUDE_MAX,
        )?;
        check_range("DatasetteTapeAzimuthError", self.azimuth_error, Self::AZIMUTH_ERROR_MAX)
    }
}

fn check_range(name: &str, value: u32, max: u32) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::invalid(name, value));
    }
    Ok(())
}

/// RAM expansion selection and image files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemHackConfig {
    pub kind: MemHackKind,
    pub c64_256k_filename: Option<PathBuf>,
    pub c64_256k_base: u16,
    pub plus60k_filename: Option<PathBuf>,
    pub plus60k_base: u16,
    pub plus256k_filename: Option<PathBuf>,
}

impl Default for MemHackConfig {
    fn default() -> Self {
        Self {
            kind: MemHackKind::None,
            c64_256k_filename: None,
            c64_256k_base: crate::memhack::C64_256K_DEFAULT_BASE,
            plus60k_filename: None,
            plus60k_base: crate::memhack::PLUS60K_DEFAULT_BASE,
            plus256k_filename: None,
        }
    }
}

impl MemHackConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !crate::memhack::C64_256K_BASES.contains(&self.c64_256k_base) {
            return Err(ConfigError::invalid("C64_256Kbase", self.c64_256k_base));
        }
        if !crate::memhack::PLUS60K_BASES.contains(&self.plus60k_base) {
            return Err(ConfigError::invalid("PLUS60Kbase", self.plus60k_base));
        }
        Ok(())
    }
}

/// Device ids plugged into the two tape ports (0 = none).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapeportConfig {
    pub port1_device: u32,
    pub port2_device: u32,
}

impl Default for TapeportConfig {
    fn default() -> Self {
        Self {
            port1_device: crate::tapeport::TAPEPORT_DEVICE_DATASETTE,
            port2_device: crate::tapeport::TAPEPORT_DEVICE_NONE,
        }
    }
}

/// ROM images. Blank (all $FF) unless supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roms {
    /// 8,192 bytes at $E000.
    pub kernal: Vec<u8>,
    /// 8,192 bytes at $A000.
    pub basic: Vec<u8>,
    /// 4,096 bytes.
    pub chargen: Vec<u8>,
}

impl Default for Roms {
    fn default() -> Self {
        Self {
            kernal: vec![0xFF; 0x2000],
            basic: vec![0xFF; 0x2000],
            chargen: vec![0xFF; 0x1000],
        }
    }
}

impl Roms {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, rom, expected) in [
            ("Kernal", &self.kernal, 0x2000),
            ("BASIC", &self.basic, 0x2000),
            ("Character", &self.chargen, 0x1000),
        ] {
            if rom.len() != expected {
                return Err(ConfigError::RomSize {
                    name,
                    expected,
                    actual: rom.len(),
                });
            }
        }
        Ok(())
    }
}

/// Everything needed to construct a [`Machine`](crate::Machine).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub model: C64Model,
    pub timing: TimingStandard,
    pub io_collision: CollisionMode,
    pub datasette: DatasetteConfig,
    pub memhack: MemHackConfig,
    pub tapeport: TapeportConfig,
    #[serde(skip)]
    pub roms: Roms,
}

impl MachineConfig {
    /// Parse and validate a JSON configuration. ROMs stay blank.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.timing.supported_by(self.model) {
            return Err(ConfigError::invalid(
                "MachineVideoStandard",
                self.timing.resource_value(),
            ));
        }
        self.roms.validate()?;
        self.datasette.validate()?;
        self.memhack.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn timing_table() {
        let pal = TimingStandard::Pal.timing();
        assert_eq!(pal.cycles_per_frame, 19_656);
        assert_eq!(pal.power_freq, 50);
        assert!((pal.frames_per_sec - 50.124).abs() < 0.001);

        let ntsc = TimingStandard::Ntsc.timing();
        assert_eq!((ntsc.cycles_per_line, ntsc.lines_per_frame), (65, 263));
        assert_eq!(TimingStandard::NtscOld.timing().cycles_per_frame, 64 * 262);
        assert_eq!(TimingStandard::PalN.timing().cycles_per_sec, 1_023_440);
    }

    #[test]
    fn json_overrides_defaults() {
        let config = MachineConfig::from_json(
            r#"{
                "model": "c128",
                "timing": "ntsc",
                "datasette": { "zero_gap_delay": 3000 },
                "memhack": { "kind": "plus60k", "plus60k_base": 53504 }
            }"#,
        )
        .expect("valid config");
        assert_eq!(config.model, C64Model::C128);
        assert_eq!(config.timing, TimingStandard::Ntsc);
        assert_eq!(config.datasette.zero_gap_delay, 3000);
        assert!(config.datasette.reset_with_cpu);
        assert_eq!(config.memhack.kind, MemHackKind::Plus60K);
        assert_eq!(config.memhack.plus60k_base, 0xD100);
        assert_eq!(config.tapeport, TapeportConfig::default());
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let err = MachineConfig::from_json(r#"{ "datasette": { "azimuth_error": 30000 } }"#)
            .expect_err("azimuth too large");
        assert_eq!(err, ConfigError::invalid("DatasetteTapeAzimuthError", 30000));

        let err = MachineConfig::from_json(r#"{ "memhack": { "c64_256k_base": 1234 } }"#)
            .expect_err("bad base");
        assert_eq!(err, ConfigError::invalid("C64_256Kbase", 1234));

        let err = MachineConfig::from_json(r#"{ "model": "c128", "timing": "pal-n" }"#)
            .expect_err("no PAL-N C128");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        assert!(matches!(
            MachineConfig::from_json("{ nope"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rom_sizes_are_checked() {
        let mut config = MachineConfig::default();
        config.roms.chargen = vec![0; 10];
        assert_eq!(
            config.validate(),
            Err(ConfigError::RomSize {
                name: "Character",
                expected: 0x1000,
                actual: 10
            })
        );
    }
}
