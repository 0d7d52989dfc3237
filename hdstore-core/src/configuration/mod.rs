//! Channel configuration model
//!
//! A channel is configured from a flat string map. Scalar keys carry the data
//! type, the accepted time delta, the maximum compression level and the
//! calculation methods; per-level keys end in the level number.

mod duration;
mod properties;

pub use duration::{format_duration, parse_duration};
pub use properties::{JsonPropertiesFile, Properties, PropertiesSource};

use crate::{CalculationMethod, DataType, HdError, Result};

/// Payload type of the channel (`LONG` or `DOUBLE`)
pub const DATA_TYPE_KEY: &str = "datatype";
/// Highest compression level
pub const MAXIMUM_COMPRESSION_LEVEL_KEY: &str = "maximum_compression_level";
/// Comma separated calculation methods deriving levels 1..=N
pub const CALCULATION_METHODS_KEY: &str = "calculation_methods";
/// Tolerance for late and early raw writes
pub const ACCEPTED_TIME_DELTA_KEY: &str = "accepted_time_delta";
/// Slot span of a level
pub const COMPRESSION_TIMESPAN_KEY_PREFIX: &str = "compression_timespan_level_";
/// Retention of a level
pub const PROPOSED_DATA_AGE_KEY_PREFIX: &str = "proposed_data_age_level_";
/// Fragment span of a level
pub const FRAGMENT_TIMESPAN_KEY_PREFIX: &str = "manager_fragment_timespan_level_";

/// Settings of one compression level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelConfiguration {
    /// Time represented by one slot (level 0: raw quantization)
    pub compression_timespan: i64,
    /// Retention after a fragment's end
    pub proposed_data_age: i64,
    /// Time covered by one fragment file
    pub fragment_timespan: i64,
}

impl LevelConfiguration {
    /// Slots per fragment
    pub fn capacity(&self) -> u32 {
        (self.fragment_timespan / self.compression_timespan) as u32
    }
}

/// Validated configuration of one calculating storage channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfiguration {
    data_type: DataType,
    accepted_time_delta: i64,
    calculation_methods: Vec<CalculationMethod>,
    levels: Vec<LevelConfiguration>,
}

impl ChannelConfiguration {
    /// Build and validate a configuration; `levels[0]` is the raw level
    pub fn new(
        data_type: DataType,
        accepted_time_delta: i64,
        calculation_methods: Vec<CalculationMethod>,
        levels: Vec<LevelConfiguration>,
    ) -> Result<Self> {
        let config = Self {
            data_type,
            accepted_time_delta,
            calculation_methods,
            levels,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse the flat key space
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let data_type: DataType = required(properties, DATA_TYPE_KEY)?.parse()?;

        let max_level: u32 = required(properties, MAXIMUM_COMPRESSION_LEVEL_KEY)?
            .trim()
            .parse()
            .map_err(|_| {
                HdError::Config(format!("{} must be a non-negative integer", MAXIMUM_COMPRESSION_LEVEL_KEY))
            })?;

        let accepted_time_delta = parse_duration(required(properties, ACCEPTED_TIME_DELTA_KEY)?)?;

        let calculation_methods = match properties.get(CALCULATION_METHODS_KEY) {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect::<Result<Vec<CalculationMethod>>>()?,
            None if max_level == 0 => Vec::new(),
            None => {
                return Err(HdError::Config(format!(
                    "Missing required key: {}",
                    CALCULATION_METHODS_KEY
                )))
            }
        };

        let levels = (0..=max_level)
            .map(|level| {
                Ok(LevelConfiguration {
                    compression_timespan: level_duration(properties, COMPRESSION_TIMESPAN_KEY_PREFIX, level)?,
                    proposed_data_age: level_duration(properties, PROPOSED_DATA_AGE_KEY_PREFIX, level)?,
                    fragment_timespan: level_duration(properties, FRAGMENT_TIMESPAN_KEY_PREFIX, level)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(data_type, accepted_time_delta, calculation_methods, levels)
    }

    /// Render back into the flat key space
    pub fn to_properties(&self) -> Properties {
        let mut props = Properties::new();
        props.insert(DATA_TYPE_KEY.into(), self.data_type.to_string());
        props.insert(
            MAXIMUM_COMPRESSION_LEVEL_KEY.into(),
            self.maximum_compression_level().to_string(),
        );
        props.insert(
            ACCEPTED_TIME_DELTA_KEY.into(),
            format_duration(self.accepted_time_delta),
        );
        props.insert(
            CALCULATION_METHODS_KEY.into(),
            self.calculation_methods
                .iter()
                .map(|m| m.label())
                .collect::<Vec<_>>()
                .join(","),
        );
        for (level, cfg) in self.levels.iter().enumerate() {
            props.insert(
                format!("{}{}", COMPRESSION_TIMESPAN_KEY_PREFIX, level),
                format_duration(cfg.compression_timespan),
            );
            props.insert(
                format!("{}{}", PROPOSED_DATA_AGE_KEY_PREFIX, level),
                format_duration(cfg.proposed_data_age),
            );
            props.insert(
                format!("{}{}", FRAGMENT_TIMESPAN_KEY_PREFIX, level),
                format_duration(cfg.fragment_timespan),
            );
        }
        props
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn accepted_time_delta(&self) -> i64 {
        self.accepted_time_delta
    }

    /// Methods producing sibling chains at levels 1..=N
    pub fn calculation_methods(&self) -> &[CalculationMethod] {
        &self.calculation_methods
    }

    pub fn maximum_compression_level(&self) -> u32 {
        (self.levels.len() - 1) as u32
    }

    /// Settings of `level`; panics if the level is not configured
    pub fn level(&self, level: u32) -> &LevelConfiguration {
        &self.levels[level as usize]
    }

    /// Settings of all levels, raw level first
    pub fn levels(&self) -> &[LevelConfiguration] {
        &self.levels
    }

    fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            return Err(HdError::Config("At least the raw level must be configured".into()));
        }
        if self.accepted_time_delta < 0 {
            return Err(HdError::Config(format!(
                "{} must not be negative",
                ACCEPTED_TIME_DELTA_KEY
            )));
        }

        if self.levels.len() > 1 && self.calculation_methods.is_empty() {
            return Err(HdError::Config(
                "Compression levels above 0 need at least one calculation method".into(),
            ));
        }
        for (i, method) in self.calculation_methods.iter().enumerate() {
            if *method == CalculationMethod::Native {
                return Err(HdError::Config("NATIVE cannot derive a compression level".into()));
            }
            if self.calculation_methods[..i].contains(method) {
                return Err(HdError::Config(format!("Duplicate calculation method: {}", method)));
            }
        }

        for (level, cfg) in self.levels.iter().enumerate() {
            if cfg.compression_timespan <= 0 || cfg.fragment_timespan <= 0 || cfg.proposed_data_age <= 0 {
                return Err(HdError::Config(format!("Level {}: timespans must be positive", level)));
            }
            if cfg.fragment_timespan % cfg.compression_timespan != 0 {
                return Err(HdError::Config(format!(
                    "Level {}: fragment timespan {} is not a multiple of the compression timespan {}",
                    level,
                    format_duration(cfg.fragment_timespan),
                    format_duration(cfg.compression_timespan)
                )));
            }
            if cfg.fragment_timespan / cfg.compression_timespan > u32::MAX as i64 {
                return Err(HdError::Config(format!("Level {}: too many slots per fragment", level)));
            }
            if level > 0 {
                let lower = self.levels[level - 1].compression_timespan;
                if cfg.compression_timespan <= lower || cfg.compression_timespan % lower != 0 {
                    return Err(HdError::Config(format!(
                        "Level {}: compression timespan {} must be a larger multiple of level {}'s {}",
                        level,
                        format_duration(cfg.compression_timespan),
                        level - 1,
                        format_duration(lower)
                    )));
                }
            }
        }

        Ok(())
    }
}

fn required<'a>(properties: &'a Properties, key: &str) -> Result<&'a str> {
    properties
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| HdError::Config(format!("Missing required key: {}", key)))
}

fn level_duration(properties: &Properties, prefix: &str, level: u32) -> Result<i64> {
    let key = format!("{}{}", prefix, level);
    parse_duration(required(properties, &key)?)
        .map_err(|e| HdError::Config(format!("{}: {}", key, e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Raw seconds, level 1 minutes, level 2 hours
    pub(crate) fn sample_properties() -> Properties {
        let mut props = Properties::new();
        for (k, v) in [
            ("datatype", "DOUBLE"),
            ("maximum_compression_level", "2"),
            ("calculation_methods", "AVG, MIN,MAX"),
            ("accepted_time_delta", "1m"),
            ("compression_timespan_level_0", "1s"),
            ("compression_timespan_level_1", "1m"),
            ("compression_timespan_level_2", "1h"),
            ("proposed_data_age_level_0", "1d"),
            ("proposed_data_age_level_1", "30d"),
            ("proposed_data_age_level_2", "5y"),
            ("manager_fragment_timespan_level_0", "1h"),
            ("manager_fragment_timespan_level_1", "1d"),
            ("manager_fragment_timespan_level_2", "30d"),
        ] {
            props.insert(k.to_string(), v.to_string());
        }
        props
    }

    #[test]
    fn test_from_properties() {
        let config = ChannelConfiguration::from_properties(&sample_properties()).unwrap();

        assert_eq!(config.data_type(), DataType::Double);
        assert_eq!(config.accepted_time_delta(), 60_000);
        assert_eq!(config.maximum_compression_level(), 2);
        assert_eq!(
            config.calculation_methods(),
            &[CalculationMethod::Average, CalculationMethod::Minimum, CalculationMethod::Maximum]
        );
        assert_eq!(config.level(0).capacity(), 3_600);
        assert_eq!(config.level(1).capacity(), 1_440);
        assert_eq!(config.level(2).compression_timespan, 60 * config.level(1).compression_timespan);
    }

    #[test]
    fn test_properties_round_trip() {
        let config = ChannelConfiguration::from_properties(&sample_properties()).unwrap();
        let again = ChannelConfiguration::from_properties(&config.to_properties()).unwrap();
        assert_eq!(config, again);
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let mut props = sample_properties();
        props.remove("proposed_data_age_level_1");

        let err = ChannelConfiguration::from_properties(&props).unwrap_err();
        assert!(err.to_string().contains("proposed_data_age_level_1"));
    }

    #[test]
    fn test_malformed_duration_is_fatal() {
        let mut props = sample_properties();
        props.insert("compression_timespan_level_1".into(), "1 minute".into());
        assert!(matches!(
            ChannelConfiguration::from_properties(&props),
            Err(HdError::Config(_))
        ));
    }

    #[test]
    fn test_level_geometry_is_validated() {
        let mut props = sample_properties();
        props.insert("compression_timespan_level_1".into(), "90s".into());
        props.insert("manager_fragment_timespan_level_1".into(), "1h 30s".into());
        let err = ChannelConfiguration::from_properties(&props).unwrap_err();
        assert!(err.to_string().contains("Level 1"));

        let mut props = sample_properties();
        props.insert("compression_timespan_level_2".into(), "1m".into());
        assert!(ChannelConfiguration::from_properties(&props).is_err());
    }

    #[test]
    fn test_method_list_is_validated() {
        let mut props = sample_properties();
        props.insert("calculation_methods".into(), "AVG,AVG".into());
        assert!(ChannelConfiguration::from_properties(&props).is_err());

        props.insert("calculation_methods".into(), "NATIVE".into());
        assert!(ChannelConfiguration::from_properties(&props).is_err());

        props.insert("calculation_methods".into(), "MEDIAN".into());
        assert!(ChannelConfiguration::from_properties(&props).is_err());

        props.remove("calculation_methods");
        assert!(ChannelConfiguration::from_properties(&props).is_err());
    }

    #[test]
    fn test_raw_only_channel_needs_no_methods() {
        let mut props = Properties::new();
        for (k, v) in [
            ("datatype", "LONG"),
            ("maximum_compression_level", "0"),
            ("accepted_time_delta", "0ms"),
            ("compression_timespan_level_0", "1s"),
            ("proposed_data_age_level_0", "1d"),
            ("manager_fragment_timespan_level_0", "1h"),
        ] {
            props.insert(k.to_string(), v.to_string());
        }
        let config = ChannelConfiguration::from_properties(&props).unwrap();
        assert_eq!(config.maximum_compression_level(), 0);
        assert!(config.calculation_methods().is_empty());
    }
}
