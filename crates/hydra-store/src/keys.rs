//! ---
//! hydra_section: "03-store-adapter"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Backing store contract and adapters."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
//! Key and channel names. These must match other Hydra implementations exactly.

use hydra_common::config::DEFAULT_KEY_PREFIX;

/// Builds every key and channel name under a shared prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeySpace {
    /// Key space rooted at `prefix`, e.g. `hydra:service`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Liveness key, refreshed every tick with a short TTL.
    pub fn presence(&self, service: &str, instance: &str) -> String {
        format!("{}:{}:{}:presence", self.prefix, service, instance)
    }

    /// Health snapshot key.
    pub fn health(&self, service: &str, instance: &str) -> String {
        format!("{}:{}:{}:health", self.prefix, service, instance)
    }

    /// Directory hash holding one presence entry per instance id.
    pub fn nodes(&self) -> String {
        format!("{}:nodes", self.prefix)
    }

    /// One-time service registration record.
    pub fn service(&self, service: &str) -> String {
        format!("{}:{}:service", self.prefix, service)
    }

    /// Channel every instance of `service` subscribes to.
    pub fn broadcast_channel(&self, service: &str) -> String {
        format!("{}:mc:{}", self.prefix, service)
    }

    /// Channel only `instance` subscribes to.
    pub fn instance_channel(&self, service: &str, instance: &str) -> String {
        format!("{}:mc:{}:{}", self.prefix, service, instance)
    }

    /// Durable queue list awaiting a consumer.
    pub fn received_queue(&self, service: &str) -> String {
        format!("{}:{}:received", self.prefix, service)
    }

    /// Durable queue list of items handed to a consumer and not yet acknowledged.
    pub fn in_progress_queue(&self, service: &str) -> String {
        format!("{}:{}:in-progress", self.prefix, service)
    }

    /// Cache entry scoped to `service`.
    pub fn cache(&self, service: &str, key: &str) -> String {
        format!("{}:{}:cache:{}", self.prefix, service, key)
    }

    /// Scan pattern matching every liveness key of `service`.
    pub fn presence_pattern(&self, service: &str) -> String {
        format!("{}:{}:*:presence", self.prefix, service)
    }

    /// Extract the instance id from a liveness key of `service`.
    pub fn instance_from_presence<'a>(&self, service: &str, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix(':')?
            .strip_prefix(service)?
            .strip_prefix(':')?
            .strip_suffix(":presence")
            .filter(|instance| !instance.is_empty() && !instance.contains(':'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_wire_conventions() {
        let keys = KeySpace::default();
        assert_eq!(keys.presence("svc", "abc"), "hydra:service:svc:abc:presence");
        assert_eq!(keys.health("svc", "abc"), "hydra:service:svc:abc:health");
        assert_eq!(keys.nodes(), "hydra:service:nodes");
        assert_eq!(keys.service("svc"), "hydra:service:svc:service");
        assert_eq!(keys.broadcast_channel("svc"), "hydra:service:mc:svc");
        assert_eq!(keys.instance_channel("svc", "abc"), "hydra:service:mc:svc:abc");
        assert_eq!(keys.received_queue("svc"), "hydra:service:svc:received");
        assert_eq!(keys.in_progress_queue("svc"), "hydra:service:svc:in-progress");
        assert_eq!(keys.cache("svc", "k"), "hydra:service:svc:cache:k");
    }

    #[test]
    fn extracts_instance_from_presence_key() {
        let keys = KeySpace::new("test");
        let key = keys.presence("svc", "abc");
        assert_eq!(keys.instance_from_presence("svc", &key), Some("abc"));
        assert_eq!(keys.instance_from_presence("other", &key), None);
        assert_eq!(keys.instance_from_presence("svc", "test:svc:abc:health"), None);
        assert_eq!(keys.instance_from_presence("svc", "test:svc:a:b:presence"), None);
    }
}
