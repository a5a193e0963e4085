use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_LOW_WATER_MARK: u64 = 32 * 1024;
pub const DEFAULT_HIGH_WATER_MARK: u64 = 64 * 1024;
pub const MIN_LOW_WATER_MARK: u64 = 0;
pub const MIN_HIGH_WATER_MARK: u64 = 1;
pub const DEFAULT_PING_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_USER_AGENT: &str = "HttpTunnel";

/// Overrides the user agent both ends expect when set.
pub const USER_AGENT_ENV: &str = "HTTP_TUNNEL_USER_AGENT";

pub const OPTION_LOW_WATER_MARK: &str = "writebufferlowwatermark";
pub const OPTION_HIGH_WATER_MARK: &str = "writebufferhighwatermark";
pub const OPTION_PING_DELAY: &str = "pingdelay";
pub const OPTION_USER_AGENT: &str = "useragent";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("low water mark {low} must be below high water mark {high}")]
    InvertedWaterMarks { low: u64, high: u64 },
    #[error("high water mark must be at least 1")]
    HighWaterMarkTooLow,
    #[error("ping delay must be greater than zero")]
    ZeroPingDelay,
    #[error("invalid value {value:?} for option {key}")]
    InvalidValue { key: String, value: String },
}

/// Send-queue thresholds driving writability hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaterMarks {
    low: u64,
    high: u64,
}

impl WaterMarks {
    pub fn new(low: u64, high: u64) -> Result<Self, ConfigError> {
        if high < MIN_HIGH_WATER_MARK {
            return Err(ConfigError::HighWaterMarkTooLow);
        }
        if low >= high {
            return Err(ConfigError::InvertedWaterMarks { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn high(&self) -> u64 {
        self.high
    }
}

impl Default for WaterMarks {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_WATER_MARK,
            high: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// Settings shared by client tunnels and accepted tunnels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    water_marks: WaterMarks,
    ping_delay: Duration,
    user_agent: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        let user_agent = std::env::var(USER_AGENT_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        Self {
            water_marks: WaterMarks::default(),
            ping_delay: DEFAULT_PING_DELAY,
            user_agent,
        }
    }
}

impl TunnelConfig {
    pub fn water_marks(&self) -> WaterMarks {
        self.water_marks
    }

    pub fn set_water_marks(&mut self, low: u64, high: u64) -> Result<(), ConfigError> {
        self.water_marks = WaterMarks::new(low, high)?;
        Ok(())
    }

    pub fn with_water_marks(mut self, low: u64, high: u64) -> Result<Self, ConfigError> {
        self.set_water_marks(low, high)?;
        Ok(self)
    }

    /// Rejected unless it stays strictly above the current low mark.
    pub fn set_write_buffer_high_water_mark(&mut self, high: u64) -> Result<(), ConfigError> {
        self.set_water_marks(self.water_marks.low, high)
    }

    /// Rejected unless it stays strictly below the current high mark.
    pub fn set_write_buffer_low_water_mark(&mut self, low: u64) -> Result<(), ConfigError> {
        self.set_water_marks(low, self.water_marks.high)
    }

    pub fn ping_delay(&self) -> Duration {
        self.ping_delay
    }

    pub fn set_ping_delay(&mut self, delay: Duration) -> Result<(), ConfigError> {
        if delay.is_zero() {
            return Err(ConfigError::ZeroPingDelay);
        }
        self.ping_delay = delay;
        Ok(())
    }

    pub fn with_ping_delay(mut self, delay: Duration) -> Result<Self, ConfigError> {
        self.set_ping_delay(delay)?;
        Ok(self)
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn set_user_agent(&mut self, user_agent: impl Into<String>) {
        self.user_agent = user_agent.into();
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.set_user_agent(user_agent);
        self
    }

    /// Applies a named option. Keys match case-insensitively; `Ok(false)`
    /// means the key is not one this config understands.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        match key.to_ascii_lowercase().as_str() {
            OPTION_LOW_WATER_MARK => {
                self.set_write_buffer_low_water_mark(parse_number(key, value)?)?;
            }
            OPTION_HIGH_WATER_MARK => {
                self.set_write_buffer_high_water_mark(parse_number(key, value)?)?;
            }
            OPTION_PING_DELAY => {
                self.set_ping_delay(Duration::from_secs(parse_number(key, value)?))?;
            }
            OPTION_USER_AGENT => self.set_user_agent(value),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

pub fn parse_number(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TunnelConfig::default().with_user_agent(DEFAULT_USER_AGENT);
        assert_eq!(config.water_marks().low(), 32 * 1024);
        assert_eq!(config.water_marks().high(), 64 * 1024);
        assert_eq!(config.ping_delay(), Duration::from_secs(5));
        assert_eq!(config.user_agent(), "HttpTunnel");
    }

    #[test]
    fn rejects_marks_that_would_cross() {
        let mut config = TunnelConfig::default();
        assert_eq!(
            config.set_write_buffer_high_water_mark(DEFAULT_LOW_WATER_MARK),
            Err(ConfigError::InvertedWaterMarks {
                low: DEFAULT_LOW_WATER_MARK,
                high: DEFAULT_LOW_WATER_MARK,
            })
        );
        assert!(config
            .set_write_buffer_low_water_mark(DEFAULT_HIGH_WATER_MARK)
            .is_err());
        assert_eq!(
            WaterMarks::new(0, 0),
            Err(ConfigError::HighWaterMarkTooLow)
        );
        assert_eq!(config.water_marks(), WaterMarks::default());

        config.set_write_buffer_low_water_mark(10).unwrap();
        config.set_write_buffer_high_water_mark(11).unwrap();
        assert_eq!(config.water_marks(), WaterMarks::new(10, 11).unwrap());
    }

    #[test]
    fn option_keys_are_case_insensitive() {
        let mut config = TunnelConfig::default();
        assert!(config.set_option("writeBufferLowWaterMark", "100").unwrap());
        assert!(config.set_option("WRITEBUFFERHIGHWATERMARK", "200").unwrap());
        assert!(config.set_option("pingDelay", "2").unwrap());
        assert!(config.set_option("userAgent", "Custom/1.0").unwrap());
        assert!(!config.set_option("keepAlive", "true").unwrap());

        assert_eq!(config.water_marks(), WaterMarks::new(100, 200).unwrap());
        assert_eq!(config.ping_delay(), Duration::from_secs(2));
        assert_eq!(config.user_agent(), "Custom/1.0");
        assert!(matches!(
            config.set_option("pingDelay", "soon"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(
            config.set_option("pingDelay", "0"),
            Err(ConfigError::ZeroPingDelay)
        );
    }
}
