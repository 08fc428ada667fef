use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use config::Config;
use serde::de::{self, Deserialize, Deserializer};

use crate::Result;

///Broker configuration. The on-disk surface is line-oriented key/value
///text, `#` starts a comment, unknown keys are ignored.
#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Inner {
    #[serde(default = "Inner::port_default")]
    pub port: u16,
    ///integer port or the literal `disabled`
    #[serde(default, deserialize_with = "deserialize_websocket_port")]
    pub websocket_port: Option<u16>,
    #[serde(default = "Inner::host_default")]
    pub host: String,
    #[serde(default)]
    pub password_file: Option<String>,
    #[serde(default = "Inner::allow_anonymous_default")]
    pub allow_anonymous: bool,
    #[serde(default)]
    pub allow_zero_byte_client_id: bool,
}

impl Inner {
    fn port_default() -> u16 {
        1883
    }

    fn host_default() -> String {
        "0.0.0.0".into()
    }

    fn allow_anonymous_default() -> bool {
        true
    }
}

impl Deref for Settings {
    type Target = Inner;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings {{ port: {}, host: {} }}", self.port, self.host)
    }
}

impl Default for Settings {
    #[inline]
    fn default() -> Self {
        Self(Arc::new(Inner {
            port: Inner::port_default(),
            websocket_port: None,
            host: Inner::host_default(),
            password_file: None,
            allow_anonymous: Inner::allow_anonymous_default(),
            allow_zero_byte_client_id: false,
        }))
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::parse(&source)
    }

    pub fn parse(source: &str) -> Result<Self> {
        let mut builder = Config::builder();
        for line in source.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim()),
                None => {
                    log::warn!("configuration entry without a value, ignored: {}", line);
                    continue;
                }
            };
            builder = builder.set_override(key, value)?;
        }
        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }
}

fn deserialize_websocket_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum Port {
        Num(u16),
        Text(String),
    }

    match Option::<Port>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Port::Num(port)) => Ok(Some(port)),
        Some(Port::Text(s)) if s.eq_ignore_ascii_case("disabled") => Ok(None),
        Some(Port::Text(s)) => s.parse::<u16>().map(Some).map_err(de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.host, "0.0.0.0");
        assert_eq!(settings.websocket_port, None);
        assert!(settings.allow_anonymous);
        assert!(!settings.allow_zero_byte_client_id);
        assert_eq!(settings.password_file, None);
    }

    #[test]
    fn parse_key_value_lines() {
        let settings = Settings::parse(
            "# broker config\n\
             port 2883\n\
             host 127.0.0.1\n\
             websocket_port 8080\n\
             allow_anonymous false\n\
             allow_zero_byte_client_id true\n\
             password_file /etc/broker/passwd\n",
        )
        .unwrap();
        assert_eq!(settings.port, 2883);
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.websocket_port, Some(8080));
        assert!(!settings.allow_anonymous);
        assert!(settings.allow_zero_byte_client_id);
        assert_eq!(settings.password_file.as_deref(), Some("/etc/broker/passwd"));
    }

    #[test]
    fn websocket_port_disabled_literal() {
        let settings = Settings::parse("websocket_port disabled\n").unwrap();
        assert_eq!(settings.websocket_port, None);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let settings = Settings::parse("no_such_key 42\nport 1999\n").unwrap();
        assert_eq!(settings.port, 1999);
    }
}
