//! Resource descriptor attached to every exported span.

use crate::span::AttributeValue;
use std::collections::BTreeMap;

/// Attribute key for the logical service name.
pub const SERVICE_NAME: &str = "service.name";
/// Attribute key for the service version.
pub const SERVICE_VERSION: &str = "service.version";
/// Attribute key for the telemetry SDK name.
pub const TELEMETRY_SDK_NAME: &str = "telemetry.sdk.name";
/// Attribute key for the telemetry SDK language.
pub const TELEMETRY_SDK_LANGUAGE: &str = "telemetry.sdk.language";

/// Describes the entity producing spans. Downstream tooling filters on these
/// attributes, `service.name` in particular.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    attributes: BTreeMap<String, AttributeValue>,
}

impl Resource {
    /// Creates a resource for the named service.
    pub fn new(service_name: impl Into<String>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            SERVICE_NAME.to_string(),
            AttributeValue::String(service_name.into()),
        );
        attributes.insert(
            TELEMETRY_SDK_NAME.to_string(),
            AttributeValue::from(env!("CARGO_PKG_NAME")),
        );
        attributes.insert(TELEMETRY_SDK_LANGUAGE.to_string(), AttributeValue::from("rust"));
        Self { attributes }
    }

    /// Adds or replaces an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Sets `service.version`.
    pub fn with_version(self, version: impl Into<String>) -> Self {
        self.with_attribute(SERVICE_VERSION, AttributeValue::String(version.into()))
    }

    /// The logical service name.
    pub fn service_name(&self) -> &str {
        match self.attributes.get(SERVICE_NAME) {
            Some(AttributeValue::String(name)) => name,
            _ => "unknown_service",
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Iterates attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.attributes.iter()
    }
}

impl Default for Resource {
    fn default() -> Self {
        Self::new("unknown_service")
    }
}
