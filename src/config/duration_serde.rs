//! `with =` adapters for duration fields in config files
//!
//! A duration is written as whole seconds (`30`) or as a humantime string
//! (`"30s"`, `"1h30m"`). It is always rendered back as humantime.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Either spelling a config file may use
#[derive(Deserialize)]
#[serde(untagged)]
enum Spelled {
    Seconds(u64),
    Text(String),
}

impl Spelled {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            Spelled::Seconds(seconds) => Ok(Duration::from_secs(seconds)),
            Spelled::Text(text) => {
                let text = text.trim();
                match text.parse::<u64>() {
                    Ok(seconds) => Ok(Duration::from_secs(seconds)),
                    Err(_) => humantime::parse_duration(text)
                        .map_err(|e| format!("Invalid duration '{text}': {e}")),
                }
            }
        }
    }
}

fn render(duration: &Duration) -> String {
    humantime::format_duration(*duration).to_string()
}

pub mod duration {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&render(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Spelled::deserialize(deserializer)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }
}

pub mod option_duration {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&render(duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<Spelled>::deserialize(deserializer)?
            .map(Spelled::into_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
