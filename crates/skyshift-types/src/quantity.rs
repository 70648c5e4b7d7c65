//! CPU and memory quantities as written in cluster and job specs.
//!
//! CPU quantities use milli precision ("500m", "2", "0.5"); memory
//! quantities accept decimal and binary suffixes ("512Mi", "8Gi", "1G").

use std::{fmt::Display, str::FromStr};

use serde::{de::Visitor, Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("unsupported precision {value:?}, CPU quantities cannot be finer than 1m; use the milli form, e.g. 5m rather than 0.005"))]
    UnsupportedCpuPrecision { value: String },

    #[snafu(display("invalid cpu integer quantity {value:?}"))]
    InvalidCpuIntQuantity {
        source: std::num::ParseIntError,
        value: String,
    },

    #[snafu(display("invalid cpu float quantity {value:?}"))]
    InvalidCpuFloatQuantity {
        source: std::num::ParseFloatError,
        value: String,
    },

    #[snafu(display("invalid memory quantity {value:?}"))]
    InvalidMemoryQuantity {
        source: std::num::ParseFloatError,
        value: String,
    },

    #[snafu(display("unknown memory suffix {suffix:?} in {value:?}"))]
    UnknownMemorySuffix { suffix: String, value: String },
}

/// A CPU quantity with milli precision.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct CpuQuantity {
    millis: u64,
}

impl CpuQuantity {
    pub const fn from_millis(millis: u64) -> Self {
        CpuQuantity { millis }
    }

    pub fn as_cpu_count(&self) -> f64 {
        self.millis as f64 / 1000.
    }

    pub const fn as_milli_cpus(&self) -> u64 {
        self.millis
    }
}

impl FromStr for CpuQuantity {
    type Err = Error;

    fn from_str(q: &str) -> Result<Self> {
        let start_of_unit = q.find(|c: char| c != '.' && !c.is_numeric());
        match start_of_unit {
            Some(i) => {
                let (value, unit) = q.split_at(i);
                if unit != "m" {
                    return UnsupportedCpuPrecisionSnafu {
                        value: q.to_owned(),
                    }
                    .fail();
                }
                let millis = value
                    .parse::<u64>()
                    .context(InvalidCpuIntQuantitySnafu {
                        value: q.to_owned(),
                    })?;
                Ok(CpuQuantity::from_millis(millis))
            }
            None => {
                let cores = q
                    .parse::<f64>()
                    .context(InvalidCpuFloatQuantitySnafu {
                        value: q.to_owned(),
                    })?;
                let millis = cores * 1000.;
                if millis.fract() != 0. {
                    return UnsupportedCpuPrecisionSnafu {
                        value: q.to_owned(),
                    }
                    .fail();
                }
                Ok(CpuQuantity::from_millis(millis as u64))
            }
        }
    }
}

impl Display for CpuQuantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.millis < 1000 {
            write!(f, "{}m", self.millis)
        } else {
            write!(f, "{}", self.as_cpu_count())
        }
    }
}

impl Serialize for CpuQuantity {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CpuQuantity {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct CpuQuantityVisitor;

        impl Visitor<'_> for CpuQuantityVisitor {
            type Value = CpuQuantity;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a valid CPU quantity")
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                CpuQuantity::from_str(v).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_str(CpuQuantityVisitor)
    }
}

const MEMORY_SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.),
    ("Mi", 1024. * 1024.),
    ("Gi", 1024. * 1024. * 1024.),
    ("Ti", 1024. * 1024. * 1024. * 1024.),
    ("K", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
];

/// A memory quantity, stored internally in bytes.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct MemoryQuantity {
    bytes: f64,
}

impl MemoryQuantity {
    pub const fn from_bytes(bytes: f64) -> Self {
        MemoryQuantity { bytes }
    }

    pub fn from_mebibytes(mebibytes: f64) -> Self {
        MemoryQuantity {
            bytes: mebibytes * 1024. * 1024.,
        }
    }

    pub fn as_bytes(&self) -> f64 {
        self.bytes
    }

    pub fn as_mebibytes(&self) -> f64 {
        self.bytes / (1024. * 1024.)
    }

    pub fn as_gibibytes(&self) -> f64 {
        self.bytes / (1024. * 1024. * 1024.)
    }
}

impl FromStr for MemoryQuantity {
    type Err = Error;

    fn from_str(q: &str) -> Result<Self> {
        let start_of_unit = q.find(|c: char| c != '.' && !c.is_numeric());
        match start_of_unit {
            Some(i) => {
                let (value, suffix) = q.split_at(i);
                let factor = MEMORY_SUFFIXES
                    .iter()
                    .find(|(s, _)| *s == suffix)
                    .map(|(_, f)| *f)
                    .ok_or_else(|| Error::UnknownMemorySuffix {
                        suffix: suffix.to_owned(),
                        value: q.to_owned(),
                    })?;
                let value = value
                    .parse::<f64>()
                    .context(InvalidMemoryQuantitySnafu {
                        value: q.to_owned(),
                    })?;
                Ok(MemoryQuantity::from_bytes(value * factor))
            }
            None => {
                let bytes = q
                    .parse::<f64>()
                    .context(InvalidMemoryQuantitySnafu {
                        value: q.to_owned(),
                    })?;
                Ok(MemoryQuantity::from_bytes(bytes))
            }
        }
    }
}

impl Display for MemoryQuantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let gib = self.as_gibibytes();
        if gib >= 1. && gib.fract() == 0. {
            return write!(f, "{gib}Gi");
        }
        let mib = self.as_mebibytes();
        if mib.fract() == 0. {
            write!(f, "{mib}Mi")
        } else {
            write!(f, "{}", self.bytes)
        }
    }
}

impl Serialize for MemoryQuantity {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MemoryQuantity {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct MemoryQuantityVisitor;

        impl Visitor<'_> for MemoryQuantityVisitor {
            type Value = MemoryQuantity;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a valid memory quantity")
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                MemoryQuantity::from_str(v).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_str(MemoryQuantityVisitor)
    }
}
