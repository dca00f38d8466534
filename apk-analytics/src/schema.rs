//! Static registry of analytics event schemas.
//!
//! Every schema maps to the set of attributes an event must carry and the exact value type each
//! attribute must have. The tables are compiled in and never change at runtime.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Attribute names as they appear on the wire.
pub mod attributes {
    pub const CORRELATION_ID: &str = "correlationId";
    pub const KEY_TYPE: &str = "keyType";
    pub const API_ID: &str = "apiId";
    pub const API_NAME: &str = "apiName";
    pub const API_CONTEXT: &str = "apiContext";
    pub const USER_NAME: &str = "userName";
    pub const API_VERSION: &str = "apiVersion";
    pub const API_CREATOR: &str = "apiCreator";
    pub const API_METHOD: &str = "apiMethod";
    pub const API_RESOURCE_TEMPLATE: &str = "apiResourceTemplate";
    pub const API_CREATOR_TENANT_DOMAIN: &str = "apiCreatorTenantDomain";
    pub const DESTINATION: &str = "destination";
    pub const APPLICATION_ID: &str = "applicationId";
    pub const APPLICATION_NAME: &str = "applicationName";
    pub const APPLICATION_OWNER: &str = "applicationOwner";
    pub const REGION_ID: &str = "regionId";
    pub const ORGANIZATION_ID: &str = "organizationId";
    pub const ENVIRONMENT_ID: &str = "environmentId";
    pub const GATEWAY_TYPE: &str = "gatewayType";
    pub const USER_AGENT_HEADER: &str = "userAgentHeader";
    pub const USER_AGENT: &str = "userAgent";
    pub const PLATFORM: &str = "platform";
    pub const PROXY_RESPONSE_CODE: &str = "proxyResponseCode";
    pub const TARGET_RESPONSE_CODE: &str = "targetResponseCode";
    pub const RESPONSE_CACHE_HIT: &str = "responseCacheHit";
    pub const RESPONSE_LATENCY: &str = "responseLatency";
    pub const BACKEND_LATENCY: &str = "backendLatency";
    pub const REQUEST_MEDIATION_LATENCY: &str = "requestMediationLatency";
    pub const RESPONSE_MEDIATION_LATENCY: &str = "responseMediationLatency";
    pub const REQUEST_TIMESTAMP: &str = "requestTimestamp";
    pub const EVENT_TYPE: &str = "eventType";
    pub const API_TYPE: &str = "apiType";
    pub const USER_IP: &str = "userIp";
    pub const ERROR_TYPE: &str = "errorType";
    pub const ERROR_CODE: &str = "errorCode";
    pub const ERROR_MESSAGE: &str = "errorMessage";
    pub const PROPERTIES: &str = "properties";

    /// Property carrying the URL the client originally invoked on the gateway.
    pub const GATEWAY_URL: &str = "x-original-gw-url";
}

use attributes::*;

/// The primitive type an attribute value must have.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AttributeType {
    /// UTF-8 text.
    String,
    /// A 32-bit signed integer, used for status and error codes.
    Integer,
    /// A 64-bit signed integer, used for latencies.
    Long,
    /// A flag.
    Boolean,
    /// A free-form nested object.
    Map,
}

impl AttributeType {
    /// Returns the name used in validation messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "String",
            Self::Integer => "Integer",
            Self::Long => "Long",
            Self::Boolean => "Boolean",
            Self::Map => "Map",
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The type discriminator attached to every built event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// A completed API invocation.
    Response,
    /// A failed API invocation.
    Fault,
}

impl EventType {
    /// Returns the wire value of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Response => "response",
            Self::Fault => "fault",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies an event schema.
///
/// Counters are created with [`MetricSchema::Response`] or [`MetricSchema::Error`]. Each reporter
/// family resolves those to its own concrete schema.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricSchema {
    /// Generic API invocation.
    Response,
    /// Generic API fault.
    Error,
    /// Invocation published to the cloud event hub or Moesif.
    ChoreoResponse,
    /// Fault published to the cloud event hub or Moesif.
    ChoreoError,
    /// Invocation written to the log stream.
    ElkResponse,
    /// Fault written to the log stream, without response latency.
    ElkError,
    /// Invocation recorded as Prometheus metrics.
    PrometheusResponse,
    /// Fault recorded as Prometheus metrics, with the latency breakdown.
    PrometheusError,
}

impl MetricSchema {
    /// Returns the required attributes and their types, in validation order.
    pub fn required_attributes(&self) -> &'static [(&'static str, AttributeType)] {
        match self {
            Self::Response
            | Self::ChoreoResponse
            | Self::ElkResponse
            | Self::PrometheusResponse => RESPONSE_ATTRIBUTES,
            Self::Error | Self::ChoreoError => ERROR_ATTRIBUTES,
            Self::ElkError => ELK_ERROR_ATTRIBUTES,
            Self::PrometheusError => PROMETHEUS_ERROR_ATTRIBUTES,
        }
    }

    /// Returns the expected type of `attribute`, or `None` if the schema does not require it.
    pub fn attribute_type(&self, attribute: &str) -> Option<AttributeType> {
        self.required_attributes()
            .iter()
            .find(|(name, _)| *name == attribute)
            .map(|(_, ty)| *ty)
    }

    /// Returns the discriminator for events of this schema.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Response
            | Self::ChoreoResponse
            | Self::ElkResponse
            | Self::PrometheusResponse => EventType::Response,
            Self::Error | Self::ChoreoError | Self::ElkError | Self::PrometheusError => {
                EventType::Fault
            }
        }
    }

    /// Returns the configuration name of the schema.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Response => "RESPONSE",
            Self::Error => "ERROR",
            Self::ChoreoResponse => "CHOREO_RESPONSE",
            Self::ChoreoError => "CHOREO_ERROR",
            Self::ElkResponse => "ELK_RESPONSE",
            Self::ElkError => "ELK_ERROR",
            Self::PrometheusResponse => "PROMETHEUS_RESPONSE",
            Self::PrometheusError => "PROMETHEUS_ERROR",
        }
    }
}

impl fmt::Display for MetricSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static RESPONSE_ATTRIBUTES: &[(&str, AttributeType)] = &[
    (REQUEST_TIMESTAMP, AttributeType::String),
    (CORRELATION_ID, AttributeType::String),
    (KEY_TYPE, AttributeType::String),
    (API_ID, AttributeType::String),
    (API_TYPE, AttributeType::String),
    (API_NAME, AttributeType::String),
    (API_VERSION, AttributeType::String),
    (API_CREATOR, AttributeType::String),
    (API_METHOD, AttributeType::String),
    (API_CONTEXT, AttributeType::String),
    (API_RESOURCE_TEMPLATE, AttributeType::String),
    (API_CREATOR_TENANT_DOMAIN, AttributeType::String),
    (DESTINATION, AttributeType::String),
    (APPLICATION_ID, AttributeType::String),
    (APPLICATION_NAME, AttributeType::String),
    (APPLICATION_OWNER, AttributeType::String),
    (ORGANIZATION_ID, AttributeType::String),
    (ENVIRONMENT_ID, AttributeType::String),
    (REGION_ID, AttributeType::String),
    (GATEWAY_TYPE, AttributeType::String),
    (USER_AGENT_HEADER, AttributeType::String),
    (USER_NAME, AttributeType::String),
    (USER_IP, AttributeType::String),
    (PROXY_RESPONSE_CODE, AttributeType::Integer),
    (TARGET_RESPONSE_CODE, AttributeType::Integer),
    (RESPONSE_CACHE_HIT, AttributeType::Boolean),
    (RESPONSE_LATENCY, AttributeType::Long),
    (BACKEND_LATENCY, AttributeType::Long),
    (REQUEST_MEDIATION_LATENCY, AttributeType::Long),
    (RESPONSE_MEDIATION_LATENCY, AttributeType::Long),
    (PROPERTIES, AttributeType::Map),
];

static ERROR_ATTRIBUTES: &[(&str, AttributeType)] = &[
    (REQUEST_TIMESTAMP, AttributeType::String),
    (CORRELATION_ID, AttributeType::String),
    (KEY_TYPE, AttributeType::String),
    (ERROR_TYPE, AttributeType::String),
    (ERROR_CODE, AttributeType::Integer),
    (ERROR_MESSAGE, AttributeType::String),
    (API_ID, AttributeType::String),
    (API_TYPE, AttributeType::String),
    (API_NAME, AttributeType::String),
    (API_VERSION, AttributeType::String),
    (API_METHOD, AttributeType::String),
    (API_CREATOR, AttributeType::String),
    (API_CREATOR_TENANT_DOMAIN, AttributeType::String),
    (APPLICATION_ID, AttributeType::String),
    (APPLICATION_NAME, AttributeType::String),
    (APPLICATION_OWNER, AttributeType::String),
    (REGION_ID, AttributeType::String),
    (GATEWAY_TYPE, AttributeType::String),
    (PROXY_RESPONSE_CODE, AttributeType::Integer),
    (TARGET_RESPONSE_CODE, AttributeType::Integer),
    (ORGANIZATION_ID, AttributeType::String),
    (ENVIRONMENT_ID, AttributeType::String),
    (USER_IP, AttributeType::String),
    (USER_AGENT_HEADER, AttributeType::String),
    (RESPONSE_LATENCY, AttributeType::Long),
    (PROPERTIES, AttributeType::Map),
];

static ELK_ERROR_ATTRIBUTES: &[(&str, AttributeType)] = &[
    (REQUEST_TIMESTAMP, AttributeType::String),
    (CORRELATION_ID, AttributeType::String),
    (KEY_TYPE, AttributeType::String),
    (ERROR_TYPE, AttributeType::String),
    (ERROR_CODE, AttributeType::Integer),
    (ERROR_MESSAGE, AttributeType::String),
    (API_ID, AttributeType::String),
    (API_TYPE, AttributeType::String),
    (API_NAME, AttributeType::String),
    (API_VERSION, AttributeType::String),
    (API_METHOD, AttributeType::String),
    (API_CREATOR, AttributeType::String),
    (API_CREATOR_TENANT_DOMAIN, AttributeType::String),
    (APPLICATION_ID, AttributeType::String),
    (APPLICATION_NAME, AttributeType::String),
    (APPLICATION_OWNER, AttributeType::String),
    (REGION_ID, AttributeType::String),
    (GATEWAY_TYPE, AttributeType::String),
    (PROXY_RESPONSE_CODE, AttributeType::Integer),
    (TARGET_RESPONSE_CODE, AttributeType::Integer),
    (USER_IP, AttributeType::String),
    (USER_AGENT_HEADER, AttributeType::String),
    (PROPERTIES, AttributeType::Map),
];

static PROMETHEUS_ERROR_ATTRIBUTES: &[(&str, AttributeType)] = &[
    (REQUEST_TIMESTAMP, AttributeType::String),
    (CORRELATION_ID, AttributeType::String),
    (KEY_TYPE, AttributeType::String),
    (ERROR_TYPE, AttributeType::String),
    (ERROR_CODE, AttributeType::Integer),
    (ERROR_MESSAGE, AttributeType::String),
    (API_ID, AttributeType::String),
    (API_TYPE, AttributeType::String),
    (API_NAME, AttributeType::String),
    (API_VERSION, AttributeType::String),
    (API_METHOD, AttributeType::String),
    (API_CREATOR, AttributeType::String),
    (API_CREATOR_TENANT_DOMAIN, AttributeType::String),
    (APPLICATION_ID, AttributeType::String),
    (APPLICATION_NAME, AttributeType::String),
    (APPLICATION_OWNER, AttributeType::String),
    (REGION_ID, AttributeType::String),
    (GATEWAY_TYPE, AttributeType::String),
    (PROXY_RESPONSE_CODE, AttributeType::Integer),
    (TARGET_RESPONSE_CODE, AttributeType::Integer),
    (ORGANIZATION_ID, AttributeType::String),
    (ENVIRONMENT_ID, AttributeType::String),
    (USER_IP, AttributeType::String),
    (USER_AGENT_HEADER, AttributeType::String),
    (USER_NAME, AttributeType::String),
    (RESPONSE_CACHE_HIT, AttributeType::Boolean),
    (RESPONSE_LATENCY, AttributeType::Long),
    (BACKEND_LATENCY, AttributeType::Long),
    (REQUEST_MEDIATION_LATENCY, AttributeType::Long),
    (RESPONSE_MEDIATION_LATENCY, AttributeType::Long),
    (PROPERTIES, AttributeType::Map),
];

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    const ALL: [MetricSchema; 8] = [
        MetricSchema::Response,
        MetricSchema::Error,
        MetricSchema::ChoreoResponse,
        MetricSchema::ChoreoError,
        MetricSchema::ElkResponse,
        MetricSchema::ElkError,
        MetricSchema::PrometheusResponse,
        MetricSchema::PrometheusError,
    ];

    #[test]
    fn test_attribute_names_are_unique() {
        for schema in ALL {
            let names: BTreeSet<_> = schema
                .required_attributes()
                .iter()
                .map(|(name, _)| name)
                .collect();
            assert_eq!(names.len(), schema.required_attributes().len(), "{schema}");
        }
    }

    #[test]
    fn test_elk_error_omits_latency_and_tenancy() {
        assert_eq!(
            MetricSchema::Error.attribute_type(RESPONSE_LATENCY),
            Some(AttributeType::Long)
        );
        for attribute in [RESPONSE_LATENCY, ORGANIZATION_ID, ENVIRONMENT_ID] {
            assert_eq!(MetricSchema::ElkError.attribute_type(attribute), None, "{attribute}");
        }
        assert_eq!(
            MetricSchema::ElkError.required_attributes().len() + 3,
            MetricSchema::Error.required_attributes().len()
        );
    }

    #[test]
    fn test_prometheus_error_extends_error() {
        let error: BTreeSet<_> = MetricSchema::Error
            .required_attributes()
            .iter()
            .map(|(name, _)| *name)
            .collect();
        let prometheus: BTreeSet<_> = MetricSchema::PrometheusError
            .required_attributes()
            .iter()
            .map(|(name, _)| *name)
            .collect();

        assert!(error.is_subset(&prometheus));
        assert_eq!(prometheus.len() - error.len(), 5);
        assert_eq!(
            MetricSchema::PrometheusError.attribute_type(RESPONSE_CACHE_HIT),
            Some(AttributeType::Boolean)
        );
    }

    #[test]
    fn test_event_type() {
        assert_eq!(MetricSchema::ChoreoResponse.event_type(), EventType::Response);
        assert_eq!(MetricSchema::PrometheusError.event_type(), EventType::Fault);
        assert_eq!(
            serde_json::to_string(&EventType::Fault).unwrap(),
            r#""fault""#
        );
    }

    #[test]
    fn test_schema_names() {
        for schema in ALL {
            let json = serde_json::to_string(&schema).unwrap();
            assert_eq!(json, format!("\"{}\"", schema.as_str()));
        }
    }
}
