//! Event bus configuration loaded from environment variables.
//!
//! | Variable | Required | Default |
//! |----------|----------|---------|
//! | `REDIS_HOST` | yes | |
//! | `REDIS_PORT` | yes | |
//! | `REDIS_PASSWORD` | no | |
//! | `REDIS_DB` | no | |
//! | `APP_NAME` | no | `""` (envelope source tag) |
//! | `EVENT_BUS_QUEUE_NAME` | no | `events-queue` |
//! | `EVENT_BUS_QUEUE_PREFIX` | no | `EventBusService` |
//! | `EVENT_BUS_CONCURRENCY` | no | `4` |
//! | `EVENT_BUS_JOB_ATTEMPTS` | no | built-in default (1) |
//! | `EVENT_BUS_REMOVE_ON_COMPLETE` | no | built-in default (true) |
//! | `EVENT_BUS_BACKOFF_MS` | no | `1000` |
//! | `DATABASE_URL` | no | Redis job queue is used when unset |
//! | `KAFKA_BROKERS` | no | comma-separated; Kafka broadcast is used when set |
//! | `KAFKA_SSL` | no | `false` |
//! | `KAFKA_RETRY_INITIAL_MS` | no | `100` |
//! | `KAFKA_RETRY_MAX_MS` | no | `3000` |
//! | `KAFKA_RETRIES` | no | `10` |
//! | `KAFKA_SASL_ENABLED` | no | `false` |
//! | `KAFKA_SASL_MECHANISM` | no | `plain` (`scram-sha-256`, `scram-sha-512`, `aws`) |
//! | `KAFKA_SASL_USERNAME` / `KAFKA_SASL_PASSWORD` | no | `""` |
//! | `KAFKA_SASL_AWS_AUTHORIZATION_IDENTITY` | no | `""` |
//! | `KAFKA_SASL_AWS_ACCESS_KEY_ID` / `KAFKA_SASL_AWS_SECRET_ACCESS_KEY` | no | `""` |
//! | `KAFKA_SASL_AWS_SESSION_TOKEN` | no | `""` |
//!
//! Empty values are treated as unset.

use std::str::FromStr;
use std::time::Duration;

use fanout_core::EventBusError;
use fanout_events::EmitOptions;

pub const DEFAULT_QUEUE_NAME: &str = "events-queue";
pub const DEFAULT_QUEUE_PREFIX: &str = "EventBusService";
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_BACKOFF_MS: u64 = 1000;
pub const DEFAULT_KAFKA_RETRY_INITIAL_MS: u64 = 100;
pub const DEFAULT_KAFKA_RETRY_MAX_MS: u64 = 3000;
pub const DEFAULT_KAFKA_RETRIES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl From<ConfigError> for EventBusError {
    fn from(value: ConfigError) -> Self {
        EventBusError::configuration(value.to_string())
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: Option<i64>,
}

impl RedisSettings {
    /// `redis://[:password@]host:port[/db]`
    pub fn url(&self) -> String {
        let auth = self
            .password
            .as_deref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        let db = self.db.map(|d| format!("/{d}")).unwrap_or_default();
        format!("redis://{auth}{}:{}{db}", self.host, self.port)
    }
}

/// Producer retry policy for the Kafka broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaRetry {
    pub initial_retry_time: Duration,
    pub max_retry_time: Duration,
    pub retries: u32,
}

impl Default for KafkaRetry {
    fn default() -> Self {
        Self {
            initial_retry_time: Duration::from_millis(DEFAULT_KAFKA_RETRY_INITIAL_MS),
            max_retry_time: Duration::from_millis(DEFAULT_KAFKA_RETRY_MAX_MS),
            retries: DEFAULT_KAFKA_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslSettings {
    Plain {
        username: String,
        password: String,
    },
    ScramSha256 {
        username: String,
        password: String,
    },
    ScramSha512 {
        username: String,
        password: String,
    },
    Aws {
        authorization_identity: String,
        access_key_id: String,
        secret_access_key: String,
        session_token: String,
    },
}

impl SaslSettings {
    pub fn mechanism(&self) -> &'static str {
        match self {
            SaslSettings::Plain { .. } => "plain",
            SaslSettings::ScramSha256 { .. } => "scram-sha-256",
            SaslSettings::ScramSha512 { .. } => "scram-sha-512",
            SaslSettings::Aws { .. } => "aws",
        }
    }
}

/// Kafka broadcast settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    pub ssl: bool,
    pub retry: KafkaRetry,
    /// `None` when SASL is disabled.
    pub sasl: Option<SaslSettings>,
}

impl KafkaSettings {
    fn from_lookup<F>(get: F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(brokers) = get("KAFKA_BROKERS") else {
            return Ok(None);
        };
        let brokers: Vec<String> = brokers
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_string)
            .collect();
        if brokers.is_empty() {
            return Err(ConfigError::Missing("KAFKA_BROKERS"));
        }

        let flag = |key: &str| get(key).is_some_and(|v| v.trim() == "true");
        let millis = |key: &'static str, default: u64| -> Result<Duration, ConfigError> {
            Ok(Duration::from_millis(
                get(key)
                    .map(|v| parse::<u64>(key, &v))
                    .transpose()?
                    .unwrap_or(default),
            ))
        };

        let retry = KafkaRetry {
            initial_retry_time: millis("KAFKA_RETRY_INITIAL_MS", DEFAULT_KAFKA_RETRY_INITIAL_MS)?,
            max_retry_time: millis("KAFKA_RETRY_MAX_MS", DEFAULT_KAFKA_RETRY_MAX_MS)?,
            retries: get("KAFKA_RETRIES")
                .map(|v| parse::<u32>("KAFKA_RETRIES", &v))
                .transpose()?
                .unwrap_or(DEFAULT_KAFKA_RETRIES),
        };

        let sasl = if flag("KAFKA_SASL_ENABLED") {
            let text = |key: &str| get(key).unwrap_or_default();
            let mechanism = get("KAFKA_SASL_MECHANISM").unwrap_or_else(|| "plain".to_string());
            let sasl = match mechanism.trim() {
                "plain" => SaslSettings::Plain {
                    username: text("KAFKA_SASL_USERNAME"),
                    password: text("KAFKA_SASL_PASSWORD"),
                },
                "scram-sha-256" => SaslSettings::ScramSha256 {
                    username: text("KAFKA_SASL_USERNAME"),
                    password: text("KAFKA_SASL_PASSWORD"),
                },
                "scram-sha-512" => SaslSettings::ScramSha512 {
                    username: text("KAFKA_SASL_USERNAME"),
                    password: text("KAFKA_SASL_PASSWORD"),
                },
                "aws" => SaslSettings::Aws {
                    authorization_identity: text("KAFKA_SASL_AWS_AUTHORIZATION_IDENTITY"),
                    access_key_id: text("KAFKA_SASL_AWS_ACCESS_KEY_ID"),
                    secret_access_key: text("KAFKA_SASL_AWS_SECRET_ACCESS_KEY"),
                    session_token: text("KAFKA_SASL_AWS_SESSION_TOKEN"),
                },
                other => {
                    return Err(invalid(
                        "KAFKA_SASL_MECHANISM",
                        other,
                        "unsupported SASL mechanism",
                    ));
                }
            };
            Some(sasl)
        } else {
            None
        };

        Ok(Some(Self {
            brokers,
            ssl: flag("KAFKA_SSL"),
            retry,
            sasl,
        }))
    }

    /// librdkafka producer properties for these settings.
    ///
    /// AWS IAM authentication has no librdkafka equivalent and is rejected.
    pub fn producer_properties(
        &self,
        client_id: &str,
    ) -> Result<Vec<(&'static str, String)>, ConfigError> {
        let mut props = vec![
            ("bootstrap.servers", self.brokers.join(",")),
            ("client.id", client_id.to_string()),
            (
                "retry.backoff.ms",
                self.retry.initial_retry_time.as_millis().to_string(),
            ),
            (
                "retry.backoff.max.ms",
                self.retry.max_retry_time.as_millis().to_string(),
            ),
            ("message.send.max.retries", self.retry.retries.to_string()),
        ];

        let protocol = match (&self.sasl, self.ssl) {
            (None, false) => "plaintext",
            (None, true) => "ssl",
            (Some(_), false) => "sasl_plaintext",
            (Some(_), true) => "sasl_ssl",
        };
        props.push(("security.protocol", protocol.to_string()));

        let credentials = match &self.sasl {
            None => None,
            Some(SaslSettings::Plain { username, password }) => Some(("PLAIN", username, password)),
            Some(SaslSettings::ScramSha256 { username, password }) => {
                Some(("SCRAM-SHA-256", username, password))
            }
            Some(SaslSettings::ScramSha512 { username, password }) => {
                Some(("SCRAM-SHA-512", username, password))
            }
            Some(SaslSettings::Aws { .. }) => {
                return Err(invalid(
                    "KAFKA_SASL_MECHANISM",
                    "aws",
                    "not supported by the librdkafka producer",
                ));
            }
        };
        if let Some((mechanism, username, password)) = credentials {
            props.push(("sasl.mechanisms", mechanism.to_string()));
            props.push(("sasl.username", username.clone()));
            props.push(("sasl.password", password.clone()));
        }

        Ok(props)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    pub redis: RedisSettings,
    /// Envelope source tag.
    pub app_name: String,
    pub queue_name: String,
    pub queue_prefix: String,
    pub concurrency: usize,
    /// Process-wide job options layered over the built-in defaults.
    pub job_options: EmitOptions,
    pub backoff_base: Duration,
    pub database_url: Option<String>,
    pub kafka: Option<KafkaSettings>,
}

impl BusConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = get("REDIS_HOST").ok_or(ConfigError::Missing("REDIS_HOST"))?;
        let port = get("REDIS_PORT").ok_or(ConfigError::Missing("REDIS_PORT"))?;
        let port = parse::<u16>("REDIS_PORT", &port)?;

        let redis = RedisSettings {
            host,
            port,
            password: get("REDIS_PASSWORD"),
            db: get("REDIS_DB")
                .map(|v| parse::<i64>("REDIS_DB", &v))
                .transpose()?,
        };

        let concurrency = get("EVENT_BUS_CONCURRENCY")
            .map(|v| parse::<usize>("EVENT_BUS_CONCURRENCY", &v))
            .transpose()?
            .unwrap_or(DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            return Err(invalid("EVENT_BUS_CONCURRENCY", "0", "must be at least 1"));
        }

        let mut job_options = EmitOptions::default();
        if let Some(v) = get("EVENT_BUS_JOB_ATTEMPTS") {
            let attempts = parse::<u32>("EVENT_BUS_JOB_ATTEMPTS", &v)?;
            if attempts == 0 {
                return Err(invalid("EVENT_BUS_JOB_ATTEMPTS", &v, "must be at least 1"));
            }
            job_options.attempts = Some(attempts);
        }
        if let Some(v) = get("EVENT_BUS_REMOVE_ON_COMPLETE") {
            job_options.remove_on_complete = Some(parse::<bool>("EVENT_BUS_REMOVE_ON_COMPLETE", &v)?);
        }

        let backoff_ms = get("EVENT_BUS_BACKOFF_MS")
            .map(|v| parse::<u64>("EVENT_BUS_BACKOFF_MS", &v))
            .transpose()?
            .unwrap_or(DEFAULT_BACKOFF_MS);

        Ok(Self {
            redis,
            app_name: get("APP_NAME").unwrap_or_default(),
            queue_name: get("EVENT_BUS_QUEUE_NAME").unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
            queue_prefix: get("EVENT_BUS_QUEUE_PREFIX")
                .unwrap_or_else(|| DEFAULT_QUEUE_PREFIX.to_string()),
            concurrency,
            job_options,
            backoff_base: Duration::from_millis(backoff_ms),
            database_url: get("DATABASE_URL"),
            kafka: KafkaSettings::from_lookup(&get)?,
        })
    }

    /// Key namespace shared by the queue's Redis structures: `<prefix>:<name>`.
    pub fn queue_key(&self) -> String {
        format!("{}:{}", self.queue_prefix, self.queue_name)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, value, &e.to_string()))
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config =
            BusConfig::from_lookup(lookup(&[("REDIS_HOST", "localhost"), ("REDIS_PORT", "6379")]))
                .unwrap();

        assert_eq!(config.redis.url(), "redis://localhost:6379");
        assert_eq!(config.queue_key(), "EventBusService:events-queue");
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.app_name, "");
        assert_eq!(config.job_options, EmitOptions::default());
        assert!(config.database_url.is_none());
        assert!(config.kafka.is_none());
    }

    #[test]
    fn missing_host_is_fatal() {
        let err = BusConfig::from_lookup(lookup(&[("REDIS_PORT", "6379")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("REDIS_HOST"));

        let bus_err: EventBusError = err.into();
        assert!(matches!(bus_err, EventBusError::Configuration(_)));
    }

    #[test]
    fn empty_port_counts_as_missing() {
        let err = BusConfig::from_lookup(lookup(&[("REDIS_HOST", "r"), ("REDIS_PORT", " ")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("REDIS_PORT"));
    }

    #[test]
    fn non_numeric_port_is_invalid() {
        let err = BusConfig::from_lookup(lookup(&[("REDIS_HOST", "r"), ("REDIS_PORT", "redis")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "REDIS_PORT", .. }));
    }

    #[test]
    fn full_config_is_parsed() {
        let config = BusConfig::from_lookup(lookup(&[
            ("REDIS_HOST", "cache"),
            ("REDIS_PORT", "6380"),
            ("REDIS_PASSWORD", "s3cret"),
            ("REDIS_DB", "2"),
            ("APP_NAME", "orders-service"),
            ("EVENT_BUS_QUEUE_NAME", "orders"),
            ("EVENT_BUS_QUEUE_PREFIX", "bus"),
            ("EVENT_BUS_CONCURRENCY", "8"),
            ("EVENT_BUS_JOB_ATTEMPTS", "3"),
            ("EVENT_BUS_REMOVE_ON_COMPLETE", "false"),
            ("EVENT_BUS_BACKOFF_MS", "250"),
            ("DATABASE_URL", "postgres://localhost/bus"),
        ]))
        .unwrap();

        assert_eq!(config.redis.url(), "redis://:s3cret@cache:6380/2");
        assert_eq!(config.app_name, "orders-service");
        assert_eq!(config.queue_key(), "bus:orders");
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.job_options.attempts, Some(3));
        assert_eq!(config.job_options.remove_on_complete, Some(false));
        assert_eq!(config.backoff_base, Duration::from_millis(250));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/bus"));
    }

    #[test]
    fn zero_job_attempts_is_rejected() {
        let err = BusConfig::from_lookup(lookup(&[
            ("REDIS_HOST", "r"),
            ("REDIS_PORT", "1"),
            ("EVENT_BUS_JOB_ATTEMPTS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "EVENT_BUS_JOB_ATTEMPTS", .. }));
    }

    fn kafka_config(extra: &[(&str, &str)]) -> Result<KafkaSettings, ConfigError> {
        let mut pairs = vec![
            ("REDIS_HOST", "r"),
            ("REDIS_PORT", "6379"),
            ("KAFKA_BROKERS", "k1:9092, k2:9092"),
        ];
        pairs.extend_from_slice(extra);
        BusConfig::from_lookup(lookup(&pairs)).map(|c| c.kafka.expect("kafka settings"))
    }

    fn property<'a>(props: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        props.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn kafka_brokers_are_split_and_defaults_applied() {
        let kafka = kafka_config(&[]).unwrap();

        assert_eq!(kafka.brokers, vec!["k1:9092", "k2:9092"]);
        assert!(!kafka.ssl);
        assert_eq!(kafka.retry, KafkaRetry::default());
        assert!(kafka.sasl.is_none());

        let props = kafka.producer_properties("orders").unwrap();
        assert_eq!(property(&props, "bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(property(&props, "client.id"), Some("orders"));
        assert_eq!(property(&props, "security.protocol"), Some("plaintext"));
        assert_eq!(property(&props, "retry.backoff.ms"), Some("100"));
        assert_eq!(property(&props, "retry.backoff.max.ms"), Some("3000"));
        assert_eq!(property(&props, "message.send.max.retries"), Some("10"));
        assert_eq!(property(&props, "sasl.mechanisms"), None);
    }

    #[test]
    fn kafka_ssl_and_retry_are_read() {
        let kafka = kafka_config(&[
            ("KAFKA_SSL", "true"),
            ("KAFKA_RETRY_INITIAL_MS", "50"),
            ("KAFKA_RETRY_MAX_MS", "500"),
            ("KAFKA_RETRIES", "3"),
        ])
        .unwrap();

        assert!(kafka.ssl);
        assert_eq!(kafka.retry.initial_retry_time, Duration::from_millis(50));
        assert_eq!(kafka.retry.max_retry_time, Duration::from_millis(500));
        assert_eq!(kafka.retry.retries, 3);

        let props = kafka.producer_properties("svc").unwrap();
        assert_eq!(property(&props, "security.protocol"), Some("ssl"));
    }

    #[test]
    fn kafka_sasl_is_ignored_unless_enabled() {
        let kafka = kafka_config(&[("KAFKA_SASL_MECHANISM", "scram-sha-256")]).unwrap();
        assert!(kafka.sasl.is_none());
    }

    #[test]
    fn kafka_sasl_defaults_to_plain() {
        let kafka = kafka_config(&[
            ("KAFKA_SASL_ENABLED", "true"),
            ("KAFKA_SASL_USERNAME", "user"),
            ("KAFKA_SASL_PASSWORD", "pass"),
        ])
        .unwrap();

        assert_eq!(
            kafka.sasl,
            Some(SaslSettings::Plain {
                username: "user".into(),
                password: "pass".into()
            })
        );
        let props = kafka.producer_properties("svc").unwrap();
        assert_eq!(property(&props, "security.protocol"), Some("sasl_plaintext"));
        assert_eq!(property(&props, "sasl.mechanisms"), Some("PLAIN"));
        assert_eq!(property(&props, "sasl.username"), Some("user"));
        assert_eq!(property(&props, "sasl.password"), Some("pass"));
    }

    #[test]
    fn kafka_scram_sha_256_is_read() {
        let kafka = kafka_config(&[
            ("KAFKA_SASL_ENABLED", "true"),
            ("KAFKA_SASL_MECHANISM", "scram-sha-256"),
            ("KAFKA_SASL_USERNAME", "user"),
            ("KAFKA_SASL_PASSWORD", "pass"),
            ("KAFKA_SSL", "true"),
        ])
        .unwrap();

        assert_eq!(kafka.sasl.as_ref().map(SaslSettings::mechanism), Some("scram-sha-256"));
        let props = kafka.producer_properties("svc").unwrap();
        assert_eq!(property(&props, "security.protocol"), Some("sasl_ssl"));
        assert_eq!(property(&props, "sasl.mechanisms"), Some("SCRAM-SHA-256"));
    }

    #[test]
    fn kafka_scram_sha_512_is_read() {
        let kafka = kafka_config(&[
            ("KAFKA_SASL_ENABLED", "true"),
            ("KAFKA_SASL_MECHANISM", "scram-sha-512"),
        ])
        .unwrap();

        assert_eq!(
            kafka.sasl,
            Some(SaslSettings::ScramSha512 {
                username: String::new(),
                password: String::new()
            })
        );
        let props = kafka.producer_properties("svc").unwrap();
        assert_eq!(property(&props, "sasl.mechanisms"), Some("SCRAM-SHA-512"));
    }

    #[test]
    fn kafka_aws_is_read_but_has_no_producer_properties() {
        let kafka = kafka_config(&[
            ("KAFKA_SASL_ENABLED", "true"),
            ("KAFKA_SASL_MECHANISM", "aws"),
            ("KAFKA_SASL_AWS_AUTHORIZATION_IDENTITY", "arn:aws:iam::1:user/bus"),
            ("KAFKA_SASL_AWS_ACCESS_KEY_ID", "AKIA"),
            ("KAFKA_SASL_AWS_SECRET_ACCESS_KEY", "secret"),
            ("KAFKA_SASL_AWS_SESSION_TOKEN", "token"),
        ])
        .unwrap();

        assert_eq!(
            kafka.sasl,
            Some(SaslSettings::Aws {
                authorization_identity: "arn:aws:iam::1:user/bus".into(),
                access_key_id: "AKIA".into(),
                secret_access_key: "secret".into(),
                session_token: "token".into(),
            })
        );
        let err = kafka.producer_properties("svc").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "KAFKA_SASL_MECHANISM", .. }));
    }

    #[test]
    fn unsupported_sasl_mechanism_is_invalid() {
        let err = kafka_config(&[
            ("KAFKA_SASL_ENABLED", "true"),
            ("KAFKA_SASL_MECHANISM", "gssapi"),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "KAFKA_SASL_MECHANISM",
                value: "gssapi".into(),
                reason: "unsupported SASL mechanism".into(),
            }
        );
    }

    #[test]
    fn blank_broker_list_is_missing() {
        let err = kafka_config(&[("KAFKA_BROKERS", " , ")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("KAFKA_BROKERS"));
    }
}
