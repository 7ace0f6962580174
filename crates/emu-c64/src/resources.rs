//! Named runtime settings.
//!
//! Every tunable a host can change while the machine runs is exposed under
//! a fixed name. Values are integers or strings; a setter validates its
//! input and leaves the old value in place when it rejects one.

use std::fmt;

use crate::error::ConfigError;

/// A resource value as passed to [`Machine::set_resource`](crate::Machine::set_resource).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceValue {
    Int(i64),
    Str(String),
}

impl ResourceValue {
    pub(crate) fn as_int(&self, name: &str) -> Result<i64, ConfigError> {
        match self {
            ResourceValue::Int(v) => Ok(*v),
            ResourceValue::Str(s) => Err(ConfigError::invalid(name, s)),
        }
    }

    pub(crate) fn as_bool(&self, name: &str) -> Result<bool, ConfigError> {
        match self.as_int(name)? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(ConfigError::invalid(name, v)),
        }
    }

    pub(crate) fn as_str(&self, name: &str) -> Result<&str, ConfigError> {
        match self {
            ResourceValue::Str(s) => Ok(s),
            ResourceValue::Int(v) => Err(ConfigError::invalid(name, v)),
        }
    }

    /// Integer resource checked against `range`.
    pub(crate) fn in_range<T: TryFrom<i64>>(
        &self,
        name: &str,
        range: std::ops::RangeInclusive<i64>,
    ) -> Result<T, ConfigError> {
        let v = self.as_int(name)?;
        if !range.contains(&v) {
            return Err(ConfigError::invalid(name, v));
        }
        T::try_from(v).map_err(|_| ConfigError::invalid(name, v))
    }
}

impl fmt::Display for ResourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceValue::Int(v) => write!(f, "{v}"),
            ResourceValue::Str(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for ResourceValue {
    fn from(v: i64) -> Self {
        ResourceValue::Int(v)
    }
}

impl From<i32> for ResourceValue {
    fn from(v: i32) -> Self {
        ResourceValue::Int(i64::from(v))
    }
}

impl From<u32> for ResourceValue {
    fn from(v: u32) -> Self {
        ResourceValue::Int(i64::from(v))
    }
}

impl From<bool> for ResourceValue {
    fn from(v: bool) -> Self {
        ResourceValue::Int(i64::from(v))
    }
}

impl From<&str> for ResourceValue {
    fn from(v: &str) -> Self {
        ResourceValue::Str(v.to_string())
    }
}

impl From<String> for ResourceValue {
    fn from(v: String) -> Self {
        ResourceValue::Str(v)
    }
}

/// Every resource the machine answers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    MemoryHack,
    Ram256KFilename,
    Ram256KBase,
    Plus60KFilename,
    Plus60KBase,
    Plus256KFilename,
    DatasetteResetWithCpu,
    DatasetteZeroGapDelay,
    DatasetteSpeedTuning,
    DatasetteTapeWobbleFrequency,
    DatasetteTapeWobbleAmplitude,
    DatasetteTapeAzimuthError,
    DatasetteSound,
    TapePort1Device,
    TapePort2Device,
    MachineVideoStandard,
    IoCollisionHandling,
}

impl Resource {
    pub const ALL: [Resource; 17] = [
        Resource::MemoryHack,
        Resource::Ram256KFilename,
        Resource::Ram256KBase,
        Resource::Plus60KFilename,
        Resource::Plus60KBase,
        Resource::Plus256KFilename,
        Resource::DatasetteResetWithCpu,
        Resource::DatasetteZeroGapDelay,
        Resource::DatasetteSpeedTuning,
        Resource::DatasetteTapeWobbleFrequency,
        Resource::DatasetteTapeWobbleAmplitude,
        Resource::DatasetteTapeAzimuthError,
        Resource::DatasetteSound,
        Resource::TapePort1Device,
        Resource::TapePort2Device,
        Resource::MachineVideoStandard,
        Resource::IoCollisionHandling,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Resource::MemoryHack => "MemoryHack",
            Resource::Ram256KFilename => "C64_256Kfilename",
            Resource::Ram256KBase => "C64_256Kbase",
            Resource::Plus60KFilename => "PLUS60Kfilename",
            Resource::Plus60KBase => "PLUS60Kbase",
            Resource::Plus256KFilename => "PLUS256Kfilename",
            Resource::DatasetteResetWithCpu => "DatasetteResetWithCPU",
            Resource::DatasetteZeroGapDelay => "DatasetteZeroGapDelay",
            Resource::DatasetteSpeedTuning => "DatasetteSpeedTuning",
            Resource::DatasetteTapeWobbleFrequency => "DatasetteTapeWobbleFrequency",
            Resource::DatasetteTapeWobbleAmplitude => "DatasetteTapeWobbleAmplitude",
            Resource::DatasetteTapeAzimuthError => "DatasetteTapeAzimuthError",
            Resource::DatasetteSound => "DatasetteSound",
            Resource::TapePort1Device => "TapePort1Device",
            Resource::TapePort2Device => "TapePort2Device",
            Resource::MachineVideoStandard => "MachineVideoStandard",
            Resource::IoCollisionHandling => "IOCollisionHandling",
        }
    }

    /// Case-insensitive lookup.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        Self::ALL
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| ConfigError::UnknownResource(name.to_string()))
    }
}
