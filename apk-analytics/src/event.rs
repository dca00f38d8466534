//! Attribute values and built analytics events.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::schema::{AttributeType, EventType, attributes};

/// A single attribute value of an analytics event.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Integer(i32),
    Long(i64),
    Boolean(bool),
    Map(Map<String, Value>),
}

impl AttributeValue {
    /// Returns the type of this value.
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Self::String(_) => AttributeType::String,
            Self::Integer(_) => AttributeType::Integer,
            Self::Long(_) => AttributeType::Long,
            Self::Boolean(_) => AttributeType::Boolean,
            Self::Map(_) => AttributeType::Map,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Returns integral values widened to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(i64::from(*value)),
            Self::Long(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Map(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Integer(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Map<String, Value>> for AttributeValue {
    fn from(value: Map<String, Value>) -> Self {
        Self::Map(value)
    }
}

impl From<BTreeMap<String, String>> for AttributeValue {
    fn from(value: BTreeMap<String, String>) -> Self {
        Self::Map(
            value
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        )
    }
}

/// A validated, filtered analytics event ready to be handed to a sink.
///
/// Serializes to a flat JSON object of its attributes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    #[serde(skip)]
    metric: Arc<str>,
    #[serde(skip)]
    event_type: EventType,
    #[serde(flatten)]
    attributes: BTreeMap<String, AttributeValue>,
}

impl Event {
    pub(crate) fn new(
        metric: Arc<str>,
        event_type: EventType,
        attributes: BTreeMap<String, AttributeValue>,
    ) -> Self {
        Self {
            metric,
            event_type,
            attributes,
        }
    }

    /// Name of the counter that produced this event.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Returns a string attribute, or `None` if absent or of another type.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(AttributeValue::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(AttributeValue::as_i64)
    }

    /// Returns a value from the free-form `properties` map.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.get(attributes::PROPERTIES)
            .and_then(AttributeValue::as_map)
            .and_then(|properties| properties.get(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Serializes the event into its JSON wire format.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integral_types_stay_distinct() {
        assert_eq!(
            AttributeValue::from(200).attribute_type(),
            AttributeType::Integer
        );
        assert_eq!(
            AttributeValue::from(200i64).attribute_type(),
            AttributeType::Long
        );
        assert_eq!(AttributeValue::from(200).as_i64(), Some(200));
    }

    #[test]
    fn test_event_serializes_flat() {
        let mut properties = BTreeMap::new();
        properties.insert(attributes::API_CONTEXT.to_owned(), "/pizza".to_owned());

        let mut attrs = BTreeMap::new();
        attrs.insert(attributes::API_NAME.to_owned(), "PizzaShack".into());
        attrs.insert(attributes::PROXY_RESPONSE_CODE.to_owned(), 200.into());
        attrs.insert(attributes::RESPONSE_CACHE_HIT.to_owned(), false.into());
        attrs.insert(attributes::PROPERTIES.to_owned(), properties.into());
        attrs.insert(attributes::EVENT_TYPE.to_owned(), "response".into());

        let event = Event::new("apim:response".into(), EventType::Response, attrs);

        insta::assert_snapshot!(event.to_json().unwrap(), @r#"{"apiName":"PizzaShack","eventType":"response","properties":{"apiContext":"/pizza"},"proxyResponseCode":200,"responseCacheHit":false}"#);
        assert_eq!(
            event.property(attributes::API_CONTEXT),
            Some(&Value::String("/pizza".to_owned()))
        );
        assert_eq!(event.metric(), "apim:response");
    }
}
