use crate::config::types::{
    CollectRule, Config, CrawlerConfig, EndpointConfig, EntitiesConfig, MergeConfig,
    OutputConfig, RetryConfig, ScanConfig, StreamConfig, UserAgentConfig,
};
use crate::crawler::parse_id_ranges;
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Set names used by the checkpoint layout itself
const RESERVED_SET_NAMES: &[&str] = &["state", "failed"];

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_retry_config(&config.retry)?;
    validate_output_config(&config.output)?;
    validate_endpoints(&config.endpoints)?;
    validate_streams(&config.streams, false)?;
    if let Some(entities) = &config.entities {
        validate_entities(entities)?;
    }
    if let Some(scan) = &config.scan {
        validate_scan(scan)?;
    }
    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.concurrency < 1 || config.concurrency > 256 {
        return Err(ConfigError::Validation(format!(
            "concurrency must be between 1 and 256, got {}",
            config.concurrency
        )));
    }

    if config.checkpoint_every_pages < 1 {
        return Err(ConfigError::Validation(
            "checkpoint-every-pages must be >= 1".to_string(),
        ));
    }

    if config.flush_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "flush-interval-secs must be >= 1".to_string(),
        ));
    }

    if config.progress_every_pages < 1 {
        return Err(ConfigError::Validation(
            "progress-every-pages must be >= 1".to_string(),
        ));
    }

    if config.request_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "request-timeout-secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler-name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler-name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact-url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.reset_floor_ms > config.rate_limited_delay_ms {
        return Err(ConfigError::Validation(format!(
            "reset-floor-ms ({}) cannot exceed rate-limited-delay-ms ({})",
            config.reset_floor_ms, config.rate_limited_delay_ms
        )));
    }
    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.checkpoint_dir.is_empty() {
        return Err(ConfigError::Validation(
            "checkpoint-dir cannot be empty".to_string(),
        ));
    }

    validate_name("job", &config.job)
}

fn validate_endpoints(endpoints: &[EndpointConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for endpoint in endpoints {
        validate_name("endpoint name", &endpoint.name)?;
        if !names.insert(endpoint.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Duplicate endpoint name '{}'",
                endpoint.name
            )));
        }

        Url::parse(&endpoint.prefix).map_err(|e| {
            ConfigError::InvalidUrl(format!(
                "Invalid prefix for endpoint '{}': {}",
                endpoint.name, e
            ))
        })?;
    }
    Ok(())
}

/// Validates a list of streams; templates get `{id}` substituted before parsing
fn validate_streams(streams: &[StreamConfig], templated: bool) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for stream in streams {
        validate_name("stream name", &stream.name)?;
        if !names.insert(stream.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Duplicate stream name '{}'",
                stream.name
            )));
        }

        let url = if templated {
            stream.url.replace("{id}", "0")
        } else {
            stream.url.clone()
        };
        Url::parse(&url).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid url for stream '{}': {}", stream.name, e))
        })?;

        validate_merge(&stream.name, &stream.merge)?;
        validate_collect(&stream.name, &stream.collect)?;

        if let Some(set) = &stream.stop_on_known {
            if !stream.collect.iter().any(|rule| &rule.set == set) {
                return Err(ConfigError::Validation(format!(
                    "Stream '{}' stops on set '{}' but never collects into it",
                    stream.name, set
                )));
            }
        }
    }
    Ok(())
}

fn validate_entities(entities: &EntitiesConfig) -> Result<(), ConfigError> {
    match (&entities.source_set, &entities.source_file) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::Validation(
                "[entities] takes either source-set or source-file, not both".to_string(),
            ))
        }
        (None, None) => {
            return Err(ConfigError::Validation(
                "[entities] needs a source-set or source-file".to_string(),
            ))
        }
        _ => {}
    }

    if entities.streams.is_empty() {
        return Err(ConfigError::Validation(
            "[entities] must define at least one stream".to_string(),
        ));
    }

    validate_streams(&entities.streams, true)
}

fn validate_scan(scan: &ScanConfig) -> Result<(), ConfigError> {
    if scan.page_size < 1 {
        return Err(ConfigError::Validation(
            "[scan] page-size must be >= 1".to_string(),
        ));
    }

    parse_id_ranges(&scan.ranges)?;

    Url::parse(&scan.url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid [scan] url: {}", e)))?;

    if scan.id_param.is_empty() {
        return Err(ConfigError::Validation(
            "[scan] id-param cannot be empty".to_string(),
        ));
    }

    validate_merge("scan", &scan.merge)?;
    validate_collect("scan", &scan.collect)
}

fn validate_merge(stream: &str, merge: &MergeConfig) -> Result<(), ConfigError> {
    match merge {
        MergeConfig::Flat { field } if field.is_empty() => Err(ConfigError::Validation(
            format!("Stream '{}' has an empty merge field", stream),
        )),
        MergeConfig::ById { fields, key } if fields.is_empty() || key.is_empty() => {
            Err(ConfigError::Validation(format!(
                "Stream '{}' needs at least one merge field and a key",
                stream
            )))
        }
        _ => Ok(()),
    }
}

fn validate_collect(stream: &str, rules: &[CollectRule]) -> Result<(), ConfigError> {
    for rule in rules {
        validate_name("set name", &rule.set)?;
        if RESERVED_SET_NAMES.contains(&rule.set.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Stream '{}' collects into reserved set name '{}'",
                stream, rule.set
            )));
        }
        if rule.field.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Stream '{}' has a collect rule with an empty field",
                stream
            )));
        }
    }
    Ok(())
}

/// Names end up in checkpoint file names
fn validate_name(what: &str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::Validation(format!("{} cannot be empty", what)));
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ConfigError::Validation(format!(
            "{} must contain only alphanumeric characters, '-' and '_', got '{}'",
            what, name
        )));
    }

    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    if email.is_empty() {
        return Err(ConfigError::Validation(
            "contact-email cannot be empty".to_string(),
        ));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || !parts[1].contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    Ok(())
}
