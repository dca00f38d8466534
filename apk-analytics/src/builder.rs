//! Schema-driven construction and validation of analytics events.
//!
//! An [`EventBuilder`] is obtained from a [`Counter`](crate::Counter), populated by the request
//! path and validated by a queue worker. Which schema a builder checks against, and which
//! attributes it derives, is decided by the reporter's [`BuilderTable`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use apk_ua::UserAgentCache;
use serde_json::Value;

use crate::event::{AttributeValue, Event};
use crate::schema::{AttributeType, MetricSchema, attributes};

/// An event failed validation and will not be published.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum MetricReportingError {
    /// A required attribute was not added to the builder.
    #[error("`{key}` is missing in metric data. This metric event will not be processed further.")]
    MissingAttribute { key: &'static str },

    /// A required attribute has a value of the wrong type.
    #[error(
        "`{key}` is expecting a `{expected}` type attribute while attribute of type `{actual}` is present."
    )]
    TypeMismatch {
        key: &'static str,
        expected: AttributeType,
        actual: AttributeType,
    },

    /// The builder was created for another counter's schema.
    #[error("event built for schema {actual} cannot be reported on a {expected} counter")]
    SchemaMismatch {
        expected: MetricSchema,
        actual: MetricSchema,
    },

    /// The queue rejected the event because it is full or closed.
    #[error("analytics event queue rejected the event")]
    Dropped,
}

impl MetricReportingError {
    /// Returns the offending attribute for validation failures.
    pub fn key(&self) -> Option<&'static str> {
        match self {
            Self::MissingAttribute { key } | Self::TypeMismatch { key, .. } => Some(key),
            Self::SchemaMismatch { .. } | Self::Dropped => None,
        }
    }
}

/// Describes how builders of one reporter family produce events for one schema.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BuilderProfile {
    /// The schema the event is validated against.
    pub schema: MetricSchema,
    /// Replace `userAgentHeader` with the parsed `userAgent` and `platform`.
    pub derive_user_agent: bool,
}

impl BuilderProfile {
    /// A profile that parses the user agent header.
    pub const fn derived(schema: MetricSchema) -> Self {
        Self {
            schema,
            derive_user_agent: true,
        }
    }

    /// A profile that keeps the raw user agent header.
    pub const fn raw(schema: MetricSchema) -> Self {
        Self {
            schema,
            derive_user_agent: false,
        }
    }

    /// Returns the exact key set of events built with this profile.
    pub fn event_keys(&self) -> BTreeSet<&'static str> {
        let mut keys: BTreeSet<_> = self
            .schema
            .required_attributes()
            .iter()
            .map(|(name, _)| *name)
            .collect();

        if self.derive_user_agent && keys.remove(attributes::USER_AGENT_HEADER) {
            keys.insert(attributes::USER_AGENT);
            keys.insert(attributes::PLATFORM);
        }

        keys.insert(attributes::EVENT_TYPE);
        keys
    }
}

/// Dispatch table from counter schemas to builder profiles.
///
/// Every reporter family registers the schemas it can publish. Counters resolve their profile
/// through the table once, when they are created.
#[derive(Clone, Debug, Default)]
pub struct BuilderTable {
    profiles: HashMap<MetricSchema, BuilderProfile>,
}

impl BuilderTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the profile used for counters of `schema`, replacing any previous entry.
    pub fn register(mut self, schema: MetricSchema, profile: BuilderProfile) -> Self {
        self.profiles.insert(schema, profile);
        self
    }

    /// Returns the profile for counters of `schema`.
    pub fn resolve(&self, schema: MetricSchema) -> Option<BuilderProfile> {
        self.profiles.get(&schema).copied()
    }

    /// Event hub publishing with parsed user agents.
    pub fn event_hub() -> Self {
        Self::new()
            .register(
                MetricSchema::Response,
                BuilderProfile::derived(MetricSchema::ChoreoResponse),
            )
            .register(
                MetricSchema::Error,
                BuilderProfile::derived(MetricSchema::ChoreoError),
            )
    }

    /// Moesif publishing, which forwards the raw user agent header.
    pub fn moesif() -> Self {
        Self::new()
            .register(
                MetricSchema::Response,
                BuilderProfile::raw(MetricSchema::ChoreoResponse),
            )
            .register(
                MetricSchema::Error,
                BuilderProfile::raw(MetricSchema::ChoreoError),
            )
    }

    /// Structured log publishing.
    pub fn elk() -> Self {
        Self::new()
            .register(
                MetricSchema::Response,
                BuilderProfile::derived(MetricSchema::ElkResponse),
            )
            .register(
                MetricSchema::Error,
                BuilderProfile::derived(MetricSchema::ElkError),
            )
    }

    /// Prometheus metric recording.
    pub fn prometheus() -> Self {
        Self::new()
            .register(
                MetricSchema::Response,
                BuilderProfile::derived(MetricSchema::PrometheusResponse),
            )
            .register(
                MetricSchema::Error,
                BuilderProfile::derived(MetricSchema::PrometheusError),
            )
    }
}

/// Accumulates the attributes of a single analytics event.
///
/// Attributes are added by the request path with [`add_attribute`](Self::add_attribute).
/// [`build`](Self::build) validates them, filters them down to the schema and derives the
/// remaining fields. The result is computed once; attributes added afterwards are ignored.
#[derive(Debug)]
pub struct EventBuilder {
    metric: Arc<str>,
    profile: BuilderProfile,
    user_agents: Arc<UserAgentCache>,
    attributes: BTreeMap<String, AttributeValue>,
    built: Option<Event>,
}

impl EventBuilder {
    /// Creates an empty builder for events of the metric named `metric`.
    pub fn new(metric: Arc<str>, profile: BuilderProfile, user_agents: Arc<UserAgentCache>) -> Self {
        Self {
            metric,
            profile,
            user_agents,
            attributes: BTreeMap::new(),
            built: None,
        }
    }

    pub fn profile(&self) -> BuilderProfile {
        self.profile
    }

    pub fn schema(&self) -> MetricSchema {
        self.profile.schema
    }

    /// Returns the exact key set of the event this builder produces.
    pub fn event_keys(&self) -> BTreeSet<&'static str> {
        self.profile.event_keys()
    }

    /// Adds an attribute, replacing any previous value under the same key.
    pub fn add_attribute(
        &mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> &mut Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Checks that every required attribute is present with the expected type.
    ///
    /// Before checking, `apiContext` and `userName` are moved out of `properties` to the top level
    /// unless the event already carries them there. The error names the first offending attribute in schema
    /// order.
    pub fn validate(&mut self) -> Result<(), MetricReportingError> {
        self.lift_default_properties();

        for &(key, expected) in self.profile.schema.required_attributes() {
            let Some(value) = self.attributes.get(key) else {
                return Err(MetricReportingError::MissingAttribute { key });
            };

            let actual = value.attribute_type();
            if actual != expected {
                return Err(MetricReportingError::TypeMismatch {
                    key,
                    expected,
                    actual,
                });
            }
        }

        Ok(())
    }

    /// Validates the attributes and returns the filtered event.
    ///
    /// Repeated calls return the same event.
    pub fn build(&mut self) -> Result<Event, MetricReportingError> {
        if let Some(ref event) = self.built {
            return Ok(event.clone());
        }

        self.validate()?;

        let mut filtered: BTreeMap<_, _> = self
            .profile
            .schema
            .required_attributes()
            .iter()
            .filter_map(|(key, _)| {
                let value = self.attributes.get(*key)?;
                Some(((*key).to_owned(), value.clone()))
            })
            .collect();

        if self.profile.derive_user_agent {
            let header = filtered.remove(attributes::USER_AGENT_HEADER);
            let info = match header.as_ref().and_then(AttributeValue::as_str) {
                Some(header) => self.user_agents.lookup(header),
                None => apk_ua::ClientInfo::unknown(),
            };
            filtered.insert(attributes::USER_AGENT.to_owned(), info.browser.into());
            filtered.insert(attributes::PLATFORM.to_owned(), info.platform.into());
        }

        let event_type = self.profile.schema.event_type();
        filtered.insert(
            attributes::EVENT_TYPE.to_owned(),
            event_type.as_str().into(),
        );

        let event = Event::new(self.metric.clone(), event_type, filtered);
        self.built = Some(event.clone());
        Ok(event)
    }

    fn lift_default_properties(&mut self) {
        let Some(AttributeValue::Map(properties)) = self.attributes.get_mut(attributes::PROPERTIES)
        else {
            return;
        };

        let context = properties.remove(attributes::API_CONTEXT);
        let user_name = properties.remove(attributes::USER_NAME);

        for (key, value) in [
            (attributes::API_CONTEXT, context),
            (attributes::USER_NAME, user_name),
        ] {
            if let Some(Value::String(value)) = value {
                self.attributes
                    .entry(key.to_owned())
                    .or_insert_with(|| value.into());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::{Map, Value, json};

    use super::*;
    use crate::schema::attributes::*;

    pub const CHROME_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
        AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    fn builder(profile: BuilderProfile) -> EventBuilder {
        EventBuilder::new(
            "apim:test".into(),
            profile,
            Arc::new(UserAgentCache::default()),
        )
    }

    fn properties() -> Map<String, Value> {
        match json!({"apiContext": "/pizzashack/1.0.0", "x-original-gw-url": "https://gw.example.com/pizzashack/1.0.0/menu"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    /// Adds every attribute of the generic response schema.
    pub fn populate_response(builder: &mut EventBuilder) {
        builder
            .add_attribute(REQUEST_TIMESTAMP, "2024-03-04T10:15:30.120Z")
            .add_attribute(CORRELATION_ID, "1234-4567")
            .add_attribute(KEY_TYPE, "PRODUCTION")
            .add_attribute(API_ID, "9876-54f1")
            .add_attribute(API_TYPE, "HTTP")
            .add_attribute(API_NAME, "PizzaShack")
            .add_attribute(API_VERSION, "1.0.0")
            .add_attribute(API_CREATOR, "admin")
            .add_attribute(API_METHOD, "POST")
            .add_attribute(API_CONTEXT, "/pizzashack/1.0.0")
            .add_attribute(API_RESOURCE_TEMPLATE, "/menu")
            .add_attribute(API_CREATOR_TENANT_DOMAIN, "carbon.super")
            .add_attribute(DESTINATION, "localhost:8080")
            .add_attribute(APPLICATION_ID, "3445-6778")
            .add_attribute(APPLICATION_NAME, "default")
            .add_attribute(APPLICATION_OWNER, "admin")
            .add_attribute(ORGANIZATION_ID, "wso2.com")
            .add_attribute(ENVIRONMENT_ID, "Production")
            .add_attribute(REGION_ID, "NA")
            .add_attribute(GATEWAY_TYPE, "ENVOY")
            .add_attribute(USER_AGENT_HEADER, CHROME_MAC)
            .add_attribute(USER_NAME, "alice")
            .add_attribute(USER_IP, "192.168.1.10")
            .add_attribute(PROXY_RESPONSE_CODE, 401)
            .add_attribute(TARGET_RESPONSE_CODE, 401)
            .add_attribute(RESPONSE_CACHE_HIT, false)
            .add_attribute(RESPONSE_LATENCY, 2000i64)
            .add_attribute(BACKEND_LATENCY, 3000i64)
            .add_attribute(REQUEST_MEDIATION_LATENCY, 1000i64)
            .add_attribute(RESPONSE_MEDIATION_LATENCY, 1000i64)
            .add_attribute(PROPERTIES, properties());
    }

    /// Adds every attribute of the generic error schema.
    pub fn populate_error(builder: &mut EventBuilder) {
        builder
            .add_attribute(REQUEST_TIMESTAMP, "2024-03-04T10:15:30.120Z")
            .add_attribute(CORRELATION_ID, "1234-4567")
            .add_attribute(KEY_TYPE, "PRODUCTION")
            .add_attribute(ERROR_TYPE, "AUTH")
            .add_attribute(ERROR_CODE, 900901)
            .add_attribute(ERROR_MESSAGE, "Invalid credentials")
            .add_attribute(API_ID, "9876-54f1")
            .add_attribute(API_TYPE, "HTTP")
            .add_attribute(API_NAME, "PizzaShack")
            .add_attribute(API_VERSION, "1.0.0")
            .add_attribute(API_METHOD, "POST")
            .add_attribute(API_CREATOR, "admin")
            .add_attribute(API_CREATOR_TENANT_DOMAIN, "carbon.super")
            .add_attribute(APPLICATION_ID, "3445-6778")
            .add_attribute(APPLICATION_NAME, "default")
            .add_attribute(APPLICATION_OWNER, "admin")
            .add_attribute(REGION_ID, "NA")
            .add_attribute(GATEWAY_TYPE, "ENVOY")
            .add_attribute(PROXY_RESPONSE_CODE, 401)
            .add_attribute(TARGET_RESPONSE_CODE, 401)
            .add_attribute(ORGANIZATION_ID, "wso2.com")
            .add_attribute(ENVIRONMENT_ID, "Production")
            .add_attribute(USER_IP, "192.168.1.10")
            .add_attribute(USER_AGENT_HEADER, CHROME_MAC)
            .add_attribute(RESPONSE_LATENCY, 120i64)
            .add_attribute(PROPERTIES, properties());
    }

    fn key_set(event: &Event) -> BTreeSet<&str> {
        event.keys().collect()
    }

    #[test]
    fn test_complete_event_builds_exact_key_set() {
        let tables = [
            BuilderTable::event_hub(),
            BuilderTable::moesif(),
            BuilderTable::elk(),
            BuilderTable::prometheus(),
        ];

        for table in tables {
            let profile = table.resolve(MetricSchema::Response).unwrap();
            let mut builder = builder(profile);
            populate_response(&mut builder);
            builder.add_attribute("unrelated", "dropped");

            assert_eq!(builder.validate(), Ok(()));
            let event = builder.build().unwrap();
            assert_eq!(key_set(&event), builder.event_keys(), "{profile:?}");
            assert!(event.get("unrelated").is_none());
        }
    }

    #[test]
    fn test_complete_fault_builds_exact_key_set() {
        for table in [BuilderTable::event_hub(), BuilderTable::moesif()] {
            let profile = table.resolve(MetricSchema::Error).unwrap();
            let mut builder = builder(profile);
            populate_error(&mut builder);

            let event = builder.build().unwrap();
            assert_eq!(key_set(&event), builder.event_keys());
            assert_eq!(event.get_str(EVENT_TYPE), Some("fault"));
        }
    }

    #[test]
    fn test_raw_profile_keeps_schema_keys_plus_event_type() {
        let profile = BuilderProfile::raw(MetricSchema::ChoreoResponse);
        let mut expected: BTreeSet<_> = MetricSchema::ChoreoResponse
            .required_attributes()
            .iter()
            .map(|(name, _)| *name)
            .collect();
        expected.insert(EVENT_TYPE);

        assert_eq!(profile.event_keys(), expected);
    }

    #[test]
    fn test_missing_attribute_is_named() {
        for &(key, _) in MetricSchema::ChoreoResponse.required_attributes() {
            let mut full = builder(BuilderProfile::derived(MetricSchema::ChoreoResponse));
            populate_response(&mut full);

            let mut partial = builder(BuilderProfile::derived(MetricSchema::ChoreoResponse));
            for (name, value) in &full.attributes {
                if name != key {
                    partial.add_attribute(name.clone(), value.clone());
                }
            }
            if key == API_CONTEXT {
                // The nested context would be lifted otherwise.
                partial.add_attribute(PROPERTIES, Map::new());
            }

            let error = partial.validate().unwrap_err();
            assert_eq!(error.key(), Some(key));
            assert!(error.to_string().contains(key));
            assert!(partial.build().is_err());
        }
    }

    #[test]
    fn test_missing_attribute_message() {
        let mut builder = builder(BuilderProfile::derived(MetricSchema::ChoreoError));
        builder
            .add_attribute(REQUEST_TIMESTAMP, "2024-03-04T10:15:30.120Z")
            .add_attribute(CORRELATION_ID, "1234-4567");

        insta::assert_snapshot!(
            builder.validate().unwrap_err(),
            @"`keyType` is missing in metric data. This metric event will not be processed further."
        );
    }

    #[test]
    fn test_mistyped_attribute() {
        let mut builder = builder(BuilderProfile::derived(MetricSchema::ChoreoResponse));
        populate_response(&mut builder);
        builder.add_attribute(RESPONSE_LATENCY, 2000);

        let error = builder.validate().unwrap_err();
        assert_eq!(
            error,
            MetricReportingError::TypeMismatch {
                key: RESPONSE_LATENCY,
                expected: AttributeType::Long,
                actual: AttributeType::Integer,
            }
        );
        insta::assert_snapshot!(
            error,
            @"`responseLatency` is expecting a `Long` type attribute while attribute of type `Integer` is present."
        );
    }

    #[test]
    fn test_api_context_lifted_from_properties() {
        let mut builder = builder(BuilderProfile::derived(MetricSchema::ChoreoResponse));
        populate_response(&mut builder);
        builder.attributes.remove(API_CONTEXT);

        let event = builder.build().unwrap();
        assert_eq!(event.get_str(API_CONTEXT), Some("/pizzashack/1.0.0"));
    }

    #[test]
    fn test_default_properties_removed_from_properties() {
        let mut builder = builder(BuilderProfile::raw(MetricSchema::ChoreoResponse));
        populate_response(&mut builder);
        let mut properties = properties();
        properties.insert(USER_NAME.to_owned(), json!("bob"));
        builder.add_attribute(PROPERTIES, properties);

        let event = builder.build().unwrap();
        assert_eq!(event.get_str(API_CONTEXT), Some("/pizzashack/1.0.0"));
        assert_eq!(event.property(API_CONTEXT), None);
        assert_eq!(event.property(USER_NAME), None);
        assert_eq!(
            event.property(GATEWAY_URL),
            Some(&json!("https://gw.example.com/pizzashack/1.0.0/menu"))
        );
    }

    #[test]
    fn test_user_name_lifted_for_prometheus() {
        let mut builder = builder(BuilderProfile::derived(MetricSchema::PrometheusResponse));
        populate_response(&mut builder);
        builder.attributes.remove(USER_NAME);
        let mut properties = properties();
        properties.insert(USER_NAME.to_owned(), json!("bob"));
        builder.add_attribute(PROPERTIES, properties);

        let event = builder.build().unwrap();
        assert_eq!(event.get_str(USER_NAME), Some("bob"));
    }

    #[test]
    fn test_user_agent_derivation() {
        let mut builder = builder(BuilderProfile::derived(MetricSchema::ChoreoResponse));
        populate_response(&mut builder);

        let event = builder.build().unwrap();
        assert_eq!(event.get_str(USER_AGENT), Some("Chrome"));
        assert_eq!(event.get_str(PLATFORM), Some("Mac OS X"));
        assert!(event.get(USER_AGENT_HEADER).is_none());
    }

    #[test]
    fn test_raw_profile_keeps_header() {
        let mut builder = builder(BuilderProfile::raw(MetricSchema::ChoreoResponse));
        populate_response(&mut builder);

        let event = builder.build().unwrap();
        assert_eq!(event.get_str(USER_AGENT_HEADER), Some(CHROME_MAC));
        assert!(event.get(USER_AGENT).is_none());
    }

    #[test]
    fn test_build_is_idempotent() {
        let mut builder = builder(BuilderProfile::derived(MetricSchema::ChoreoResponse));
        populate_response(&mut builder);

        let first = builder.build().unwrap();
        builder.add_attribute(API_NAME, "Changed");
        let second = builder.build().unwrap();
        assert_eq!(first, second);
        assert_eq!(second.get_str(API_NAME), Some("PizzaShack"));
    }

    #[test]
    fn test_builder_table_dispatch() {
        let table = BuilderTable::prometheus();
        assert_eq!(
            table.resolve(MetricSchema::Error),
            Some(BuilderProfile::derived(MetricSchema::PrometheusError))
        );
        assert_eq!(table.resolve(MetricSchema::ChoreoError), None);

        let table = table.register(
            MetricSchema::ChoreoError,
            BuilderProfile::raw(MetricSchema::ChoreoError),
        );
        assert!(table.resolve(MetricSchema::ChoreoError).is_some());
    }
}
