//! Key and consumer naming conventions.
//!
//! Every name is derived from the entity type and repository type, so
//! consumers in different processes agree on their identity without any
//! coordination.

use crate::entry::EntryId;

/// Default prefix of entity stream keys.
pub const DEFAULT_STREAM_PREFIX: &str = "wb:stream:entity";

pub const KEY_SEPARATOR: &str = ":";
pub const VALUE_SEPARATOR: &str = "_";

const DLQ_SUFFIX: &str = ":dlq";
const CONSUMER_GROUP_SUFFIX: &str = "_group";
const CONSUMER_SUFFIX: &str = "_consumer";

/// `<prefix>:<entitytype-lowercase>`
#[must_use]
pub fn stream_key(prefix: &str, entity_type: &str) -> String {
    let prefix = prefix.trim_end_matches(KEY_SEPARATOR);
    format!("{prefix}{KEY_SEPARATOR}{}", entity_type.to_lowercase())
}

/// `<streamKey>:dlq`
#[must_use]
pub fn dlq_key(stream_key: &str) -> String {
    format!("{stream_key}{DLQ_SUFFIX}")
}

/// `<streamKey>:<entryId>`
#[must_use]
pub fn counter_key(stream_key: &str, id: EntryId) -> String {
    format!("{stream_key}{KEY_SEPARATOR}{id}")
}

/// `<repositorytype-lowercase>_group`
#[must_use]
pub fn consumer_group(repository_type: &str) -> String {
    format!("{}{CONSUMER_GROUP_SUFFIX}", repository_type.to_lowercase())
}

/// `<entitytype-lowercase>_<repositorytype-lowercase>_consumer`
#[must_use]
pub fn consumer_name(entity_type: &str, repository_type: &str) -> String {
    format!(
        "{}{VALUE_SEPARATOR}{}{CONSUMER_SUFFIX}",
        entity_type.to_lowercase(),
        repository_type.to_lowercase()
    )
}

/// Resolved names for one (entity type, repository type) pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    entity_type: String,
    repository_type: String,
    stream_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
}

impl Pairing {
    /// Derive every name from the conventions.
    pub fn new(prefix: &str, entity_type: impl Into<String>, repository_type: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let repository_type = repository_type.into();
        let stream_key = stream_key(prefix, &entity_type);
        Self {
            dlq_key: dlq_key(&stream_key),
            group: consumer_group(&repository_type),
            consumer: consumer_name(&entity_type, &repository_type),
            stream_key,
            entity_type,
            repository_type,
        }
    }

    /// Override the consumer group name.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Override the consumer name.
    #[must_use]
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    #[must_use]
    pub fn repository_type(&self) -> &str {
        &self.repository_type
    }

    #[must_use]
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    #[must_use]
    pub fn dlq_key(&self) -> &str {
        &self.dlq_key
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Attempt-counter key for an entry of this pairing's stream.
    #[must_use]
    pub fn counter_key(&self, id: EntryId) -> String {
        counter_key(&self.stream_key, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_names() {
        let pairing = Pairing::new(DEFAULT_STREAM_PREFIX, "Employer", "JpaEmployerRepository");

        assert_eq!(pairing.stream_key(), "wb:stream:entity:employer");
        assert_eq!(pairing.dlq_key(), "wb:stream:entity:employer:dlq");
        assert_eq!(pairing.group(), "jpaemployerrepository_group");
        assert_eq!(pairing.consumer(), "employer_jpaemployerrepository_consumer");
        assert_eq!(
            pairing.counter_key(EntryId::new(17, 3)),
            "wb:stream:entity:employer:17-3"
        );
    }

    #[test]
    fn test_prefix_trailing_separator_is_ignored() {
        assert_eq!(stream_key("wb:stream:", "Order"), "wb:stream:order");
    }

    #[test]
    fn test_name_overrides() {
        let pairing = Pairing::new("p", "User", "Redis")
            .with_group("custom_group")
            .with_consumer("custom_consumer");
        assert_eq!(pairing.group(), "custom_group");
        assert_eq!(pairing.consumer(), "custom_consumer");
        assert_eq!(pairing.stream_key(), "p:user");
    }
}
