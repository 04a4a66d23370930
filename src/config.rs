use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;
use url::Url;

use crate::errors::ConfigError;
use crate::models::{AcademicYear, Credentials, Term, TermQuery};

const DEFAULT_BASE_URL: &str = "https://app.buaa.edu.cn";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
const DEFAULT_SMTP_PORT: u16 = 465;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalKind {
    /// Form login plus a JSON grade endpoint.
    Json,
    /// Rendered HTML pages with previous/next term controls.
    Html,
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub kind: PortalKind,
    pub base_url: Url,
    pub credentials: Credentials,
}

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub user: String,
    pub password: String,
    pub recipient: String,
}

#[derive(Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: i64,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("user", &self.user)
            .field("password", &"***")
            .field("recipient", &self.recipient)
            .finish()
    }
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig").field("bot_token", &"***").field("chat_id", &self.chat_id).finish()
    }
}

#[derive(Debug, Clone)]
pub enum ChannelConfig {
    Smtp(SmtpConfig),
    Telegram(TelegramConfig),
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub notify_on_update: bool,
    /// Only present when delivery is enabled.
    pub channel: Option<ChannelConfig>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub portal: PortalConfig,
    pub query: TermQuery,
    pub poll_interval: Duration,
    pub baseline_path: PathBuf,
    pub notify: NotifyConfig,
    pub log_level: LevelFilter,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let kind = match env.optional("PORTAL_KIND").as_deref() {
            None | Some("json") => PortalKind::Json,
            Some("html") => PortalKind::Html,
            Some(other) => {
                return Err(ConfigError::Invalid("PORTAL_KIND", format!("expected json or html, got {other:?}")))
            }
        };
        let base_url = env.parsed_or("PORTAL_BASE_URL", || Url::parse(DEFAULT_BASE_URL))?;
        let credentials = Credentials::new(env.required("PORTAL_USERNAME")?, env.required("PORTAL_PASSWORD")?);

        let year: AcademicYear = env.required("ACADEMIC_YEAR")?.parse()?;
        let term: Term = env.required("TERM")?.parse()?;

        let poll_secs: u64 = env.parsed_or("POLL_INTERVAL_SECS", || Ok::<_, std::num::ParseIntError>(DEFAULT_POLL_INTERVAL_SECS))?;
        if poll_secs == 0 {
            return Err(ConfigError::Invalid("POLL_INTERVAL_SECS", "must be greater than zero".into()));
        }

        let baseline_path = PathBuf::from(env.optional("BASELINE_PATH").unwrap_or_else(|| "grades.csv".to_string()));

        let notify = Self::notify_config(&env)?;

        let log_level = env.parsed_or("LOG_LEVEL", || Ok::<_, log::ParseLevelError>(LevelFilter::Info))?;

        Ok(Config {
            portal: PortalConfig { kind, base_url, credentials },
            query: TermQuery::new(year, term),
            poll_interval: Duration::from_secs(poll_secs),
            baseline_path,
            notify,
            log_level,
        })
    }

    fn notify_config<F>(env: &Env<F>) -> Result<NotifyConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let enabled = env.flag("NOTIFY_ENABLED", false)?;
        let max_retries: u32 = env.parsed_or("NOTIFY_MAX_RETRIES", || Ok::<_, std::num::ParseIntError>(DEFAULT_MAX_RETRIES))?;
        if max_retries == 0 {
            return Err(ConfigError::Invalid("NOTIFY_MAX_RETRIES", "must be at least 1".into()));
        }
        let retry_delay_secs: u64 =
            env.parsed_or("NOTIFY_RETRY_DELAY_SECS", || Ok::<_, std::num::ParseIntError>(DEFAULT_RETRY_DELAY_SECS))?;
        let notify_on_update = env.flag("NOTIFY_ON_UPDATE", false)?;

        let channel = if enabled {
            Some(match env.optional("NOTIFY_CHANNEL").as_deref() {
                None | Some("smtp") => ChannelConfig::Smtp(SmtpConfig {
                    host: env.required("SMTP_HOST")?,
                    port: env.parsed_or("SMTP_PORT", || Ok::<_, std::num::ParseIntError>(DEFAULT_SMTP_PORT))?,
                    tls: env.flag("SMTP_TLS", true)?,
                    user: env.required("SMTP_USER")?,
                    password: env.required("SMTP_PASSWORD")?,
                    recipient: env.required("SMTP_RECIPIENT")?,
                }),
                Some("telegram") => ChannelConfig::Telegram(TelegramConfig {
                    bot_token: env.required("BOT_TOKEN")?,
                    chat_id: env
                        .required("CHAT_ID")?
                        .parse()
                        .map_err(|e: std::num::ParseIntError| ConfigError::Invalid("CHAT_ID", e.to_string()))?,
                }),
                Some(other) => {
                    return Err(ConfigError::Invalid(
                        "NOTIFY_CHANNEL",
                        format!("expected smtp or telegram, got {other:?}"),
                    ))
                }
            })
        } else {
            None
        };

        Ok(NotifyConfig {
            enabled,
            max_retries,
            retry_delay: Duration::from_secs(retry_delay_secs),
            notify_on_update,
            channel,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    // Blank values count as unset.
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn parsed_or<T, E, D>(&self, name: &'static str, default: D) -> Result<T, ConfigError>
    where
        T: FromStr<Err = E>,
        E: ToString,
        D: FnOnce() -> Result<T, E>,
    {
        match self.optional(name) {
            Some(raw) => raw.parse().map_err(|e: E| ConfigError::Invalid(name, e.to_string())),
            None => default().map_err(|e| ConfigError::Invalid(name, e.to_string())),
        }
    }

    fn flag(&self, name: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(name).map(|v| v.to_ascii_lowercase()).as_deref() {
            None => Ok(default),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => Err(ConfigError::Invalid(name, format!("expected a boolean, got {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    const BASE: &[(&str, &str)] = &[
        ("PORTAL_USERNAME", "20231234"),
        ("PORTAL_PASSWORD", "secret"),
        ("ACADEMIC_YEAR", "2022-2023"),
        ("TERM", "2"),
    ];

    #[test]
    fn minimal_environment_uses_defaults() {
        let config = load(BASE).unwrap();
        assert_eq!(config.portal.kind, PortalKind::Json);
        assert_eq!(config.query, TermQuery::new(AcademicYear { start: 2022 }, Term::Spring));
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.baseline_path, PathBuf::from("grades.csv"));
        assert!(!config.notify.enabled);
        assert_eq!(config.notify.max_retries, 3);
        assert!(config.notify.channel.is_none());
        assert_eq!(config.log_level, LevelFilter::Info);
    }

    #[test]
    fn missing_credentials_name_the_field() {
        let vars: Vec<_> = BASE.iter().copied().filter(|(k, _)| *k != "PORTAL_PASSWORD").collect();
        assert_eq!(load(&vars).unwrap_err(), ConfigError::Missing("PORTAL_PASSWORD"));
    }

    #[test]
    fn invalid_term_is_reported() {
        let mut vars = BASE.to_vec();
        vars.retain(|(k, _)| *k != "TERM");
        vars.push(("TERM", "4"));
        assert!(matches!(load(&vars), Err(ConfigError::Invalid("TERM", _))));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut vars = BASE.to_vec();
        vars.push(("POLL_INTERVAL_SECS", "0"));
        assert!(matches!(load(&vars), Err(ConfigError::Invalid("POLL_INTERVAL_SECS", _))));
    }

    #[test]
    fn enabled_smtp_requires_mail_settings() {
        let mut vars = BASE.to_vec();
        vars.push(("NOTIFY_ENABLED", "true"));
        assert_eq!(load(&vars).unwrap_err(), ConfigError::Missing("SMTP_HOST"));

        vars.extend([
            ("SMTP_HOST", "smtp.qq.com"),
            ("SMTP_USER", "me@qq.com"),
            ("SMTP_PASSWORD", "code"),
            ("SMTP_RECIPIENT", "me@qq.com"),
            ("SMTP_TLS", "false"),
            ("SMTP_PORT", "25"),
        ]);
        let config = load(&vars).unwrap();
        match config.notify.channel {
            Some(ChannelConfig::Smtp(smtp)) => {
                assert_eq!(smtp.port, 25);
                assert!(!smtp.tls);
            }
            other => panic!("expected smtp channel, got {other:?}"),
        }
    }

    #[test]
    fn telegram_chat_id_must_be_numeric() {
        let mut vars = BASE.to_vec();
        vars.extend([
            ("NOTIFY_ENABLED", "yes"),
            ("NOTIFY_CHANNEL", "telegram"),
            ("BOT_TOKEN", "123:abc"),
            ("CHAT_ID", "not-a-number"),
        ]);
        assert!(matches!(load(&vars), Err(ConfigError::Invalid("CHAT_ID", _))));
    }

    #[test]
    fn channel_secrets_stay_out_of_debug_output() {
        let mut vars = BASE.to_vec();
        vars.extend([
            ("NOTIFY_ENABLED", "true"),
            ("SMTP_HOST", "smtp.qq.com"),
            ("SMTP_USER", "me@qq.com"),
            ("SMTP_PASSWORD", "mail-auth-code"),
            ("SMTP_RECIPIENT", "me@qq.com"),
        ]);
        let rendered = format!("{:?}", load(&vars).unwrap());
        assert!(rendered.contains("smtp.qq.com"));
        assert!(!rendered.contains("mail-auth-code"));
        assert!(!rendered.contains("secret"));

        let telegram = TelegramConfig { bot_token: "123:bot-secret".into(), chat_id: 42 };
        let rendered = format!("{telegram:?}");
        assert!(rendered.contains("42"));
        assert!(!rendered.contains("bot-secret"));
    }
}
