use std::fmt;

use serde::{
    de::{self, MapAccess, SeqAccess, Visitor},
    ser::{SerializeMap, SerializeSeq},
    Deserialize, Deserializer, Serialize, Serializer,
};

/// A JSON value whose objects are ordered member lists rather than maps.
///
/// Keeping members as a list preserves both member order and duplicate keys,
/// which occur in user-extension subtrees of events. A colliding key never
/// displaces an earlier value; [`ObjectValue::get_all`] surfaces every value
/// bound to a key.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectValue {
    /// The JSON `null`.
    Null,
    /// A JSON boolean.
    Bool(bool),
    /// A JSON number.
    Number(serde_json::Number),
    /// A JSON string.
    String(String),
    /// A JSON array.
    Array(Vec<ObjectValue>),
    /// A JSON object as an ordered member list.
    Object(Vec<(String, ObjectValue)>),
}

impl ObjectValue {
    /// Parses a byte frame into an `ObjectValue`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Returns the first value bound to `key`, if this is an object.
    pub fn get(&self, key: &str) -> Option<&ObjectValue> {
        match self {
            Self::Object(members) => members.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Returns every value bound to `key`, in member order.
    pub fn get_all<'a>(&'a self, key: &str) -> Vec<&'a ObjectValue> {
        match self {
            Self::Object(members) => members
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Returns the member list if this is an object.
    pub fn as_object(&self) -> Option<&[(String, ObjectValue)]> {
        match self {
            Self::Object(members) => Some(members),
            _ => None,
        }
    }

    /// Returns the elements if this is an array.
    pub fn as_array(&self) -> Option<&[ObjectValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the string slice if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Serializes back to compact JSON text. Duplicate members are written
    /// back verbatim.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".into())
    }
}

impl fmt::Display for ObjectValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}

impl Serialize for ObjectValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => n.serialize(serializer),
            Self::String(s) => serializer.serialize_str(s),
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Object(members) => {
                let mut map = serializer.serialize_map(Some(members.len()))?;
                for (key, value) in members {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ObjectValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = ObjectValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("any JSON value")
            }

            fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
                Ok(ObjectValue::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
                Ok(ObjectValue::Number(v.into()))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ObjectValue::Number(v.into()))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                serde_json::Number::from_f64(v)
                    .map(ObjectValue::Number)
                    .ok_or_else(|| E::custom("non-finite number"))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                Ok(ObjectValue::String(v.to_owned()))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
                Ok(ObjectValue::String(v))
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(ObjectValue::Null)
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(ObjectValue::Null)
            }

            fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
            where
                D: Deserializer<'de>,
            {
                ObjectValue::deserialize(deserializer)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(ObjectValue::Array(items))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut members = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(key) = map.next_key::<String>()? {
                    let value = map.next_value()?;
                    members.push((key, value));
                }
                Ok(ObjectValue::Object(members))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

/// The event variants recognized in the object form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// An observation of one or more objects.
    ObjectEvent,
    /// A parent/child aggregation change.
    AggregationEvent,
    /// An association with one or more business transactions.
    TransactionEvent,
    /// Inputs transformed into outputs.
    TransformationEvent,
    /// A physical/digital association (2.0 only).
    AssociationEvent,
}

impl EventKind {
    /// All recognized event kinds.
    pub const ALL: [EventKind; 5] = [
        EventKind::ObjectEvent,
        EventKind::AggregationEvent,
        EventKind::TransactionEvent,
        EventKind::TransformationEvent,
        EventKind::AssociationEvent,
    ];

    /// Parses an event type name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ObjectEvent" => Some(Self::ObjectEvent),
            "AggregationEvent" => Some(Self::AggregationEvent),
            "TransactionEvent" => Some(Self::TransactionEvent),
            "TransformationEvent" => Some(Self::TransformationEvent),
            "AssociationEvent" => Some(Self::AssociationEvent),
            _ => None,
        }
    }

    /// The type name as it appears in both serializations.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ObjectEvent => "ObjectEvent",
            Self::AggregationEvent => "AggregationEvent",
            Self::TransactionEvent => "TransactionEvent",
            Self::TransformationEvent => "TransformationEvent",
            Self::AssociationEvent => "AssociationEvent",
        }
    }
}

/// Classification of a framed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// The document header node.
    Header,
    /// An individual event node.
    Event(EventKind),
    /// Neither a header nor a recognized event.
    Unknown,
}

impl NodeKind {
    /// Classifies a node per its `type` member, falling back to the
    /// `@context` + `schemaVersion` header heuristic.
    pub fn classify(node: &ObjectValue) -> NodeKind {
        for name in type_names(node) {
            if let Some(kind) = EventKind::from_name(name) {
                return NodeKind::Event(kind);
            }
            if name.contains("EPCISDocument") || name.contains("EPCISQueryDocument") {
                return NodeKind::Header;
            }
        }
        if node.get("@context").is_some() && node.get("schemaVersion").is_some() {
            return NodeKind::Header;
        }
        NodeKind::Unknown
    }
}

fn type_names(node: &ObjectValue) -> Vec<&str> {
    match node.get("type") {
        Some(ObjectValue::String(s)) => vec![s.as_str()],
        Some(ObjectValue::Array(items)) => items.iter().filter_map(|v| v.as_str()).collect(),
        _ => Vec::new(),
    }
}

/// Document-level fields extracted from a header node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderFields {
    /// The raw `@context` value, when present.
    pub context: Option<ObjectValue>,
    /// The document `type` name.
    pub doc_type: Option<String>,
    /// The declared `schemaVersion`.
    pub schema_version: Option<String>,
    /// The creation timestamp as `(member name, value)`, preserving whether
    /// the source used `creationDate` or `createdAt`.
    pub creation: Option<(String, String)>,
    /// `subscriptionID` of a query document.
    pub subscription_id: Option<String>,
    /// `queryName` of a query document.
    pub query_name: Option<String>,
}

impl HeaderFields {
    /// Extracts the known document-level fields from a header node. Query
    /// fields are looked up both at the top level and under the
    /// `epcisBody.queryResults` wrapper.
    pub fn from_node(node: &ObjectValue) -> Self {
        let string_of = |v: Option<&ObjectValue>| v.and_then(|v| v.as_str()).map(str::to_owned);

        let query_scope = node
            .get("epcisBody")
            .and_then(|body| body.get("queryResults"));
        let query_field = |key: &str| {
            string_of(node.get(key)).or_else(|| string_of(query_scope.and_then(|q| q.get(key))))
        };

        let creation = ["creationDate", "createdAt"].iter().find_map(|name| {
            string_of(node.get(name)).map(|value| ((*name).to_owned(), value))
        });

        Self {
            context: node.get("@context").cloned(),
            doc_type: type_names(node).first().map(|s| (*s).to_owned()),
            schema_version: string_of(node.get("schemaVersion")),
            creation,
            subscription_id: query_field("subscriptionID"),
            query_name: query_field("queryName"),
        }
    }

    /// True when the header describes the query-results document flavor.
    pub fn is_query(&self) -> bool {
        self.doc_type
            .as_deref()
            .is_some_and(|t| t.contains("EPCISQueryDocument"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_keys_are_preserved() {
        let node = ObjectValue::from_slice(
            br#"{"type":"ObjectEvent","ext:field":"a","ext:field":"b","ext:field":"c"}"#,
        )
        .unwrap();

        let all = node.get_all("ext:field");
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].as_str(), Some("a"));
        assert_eq!(all[2].as_str(), Some("c"));

        // Round-trip keeps every member.
        let text = node.to_json();
        assert_eq!(text.matches("ext:field").count(), 3);
    }

    #[test]
    fn classify_header_and_events() {
        let header =
            ObjectValue::from_slice(br#"{"type":"EPCISDocument","schemaVersion":"2.0"}"#).unwrap();
        assert_eq!(NodeKind::classify(&header), NodeKind::Header);

        let query =
            ObjectValue::from_slice(br#"{"type":"EPCISQueryDocument"}"#).unwrap();
        assert_eq!(NodeKind::classify(&query), NodeKind::Header);

        let headerless =
            ObjectValue::from_slice(br#"{"@context":[],"schemaVersion":"2.0"}"#).unwrap();
        assert_eq!(NodeKind::classify(&headerless), NodeKind::Header);

        for kind in EventKind::ALL {
            let raw = format!(r#"{{"type":"{}"}}"#, kind.name());
            let node = ObjectValue::from_slice(raw.as_bytes()).unwrap();
            assert_eq!(NodeKind::classify(&node), NodeKind::Event(kind));
        }

        let unknown = ObjectValue::from_slice(br#"{"type":"SomethingElse"}"#).unwrap();
        assert_eq!(NodeKind::classify(&unknown), NodeKind::Unknown);
    }

    #[test]
    fn header_fields_from_query_document() {
        let node = ObjectValue::from_slice(
            br#"{"type":"EPCISQueryDocument","schemaVersion":"2.0",
                "createdAt":"2023-05-01T10:00:00Z",
                "epcisBody":{"queryResults":{
                    "subscriptionID":"sub-9","queryName":"SimpleEventQuery",
                    "resultsBody":{}}}}"#,
        )
        .unwrap();

        let fields = HeaderFields::from_node(&node);
        assert!(fields.is_query());
        assert_eq!(
            fields.creation,
            Some(("createdAt".into(), "2023-05-01T10:00:00Z".into()))
        );
        assert_eq!(fields.subscription_id.as_deref(), Some("sub-9"));
        assert_eq!(fields.query_name.as_deref(), Some("SimpleEventQuery"));
    }

    #[test]
    fn creation_date_name_is_preserved() {
        let node = ObjectValue::from_slice(
            br#"{"type":"EPCISDocument","creationDate":"2023-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let fields = HeaderFields::from_node(&node);
        assert_eq!(fields.creation.unwrap().0, "creationDate");
        assert!(!fields.is_query());
    }
}
