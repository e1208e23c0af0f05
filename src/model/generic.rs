//! A structural, name-driven binding between the two event serializations.
//!
//! The binding is generic over field names: known list wrappers unwrap to
//! arrays, attributed entries map attribute-plus-text to small objects, and
//! everything else (extensions included) maps structurally, keeping prefixed
//! names qualified.

use epcis_codecs::decoding::format::{EventKind, ObjectValue};
use epcis_codecs::xml::{XmlElement, XmlNode};

use super::{current_unmarshal_scope, Event, EventModel, ModelError};

/// List wrapper elements and the entry element they repeat.
const LIST_WRAPPERS: &[(&str, &str)] = &[
    ("epcList", "epc"),
    ("childEPCs", "epc"),
    ("inputEPCList", "epc"),
    ("outputEPCList", "epc"),
    ("bizTransactionList", "bizTransaction"),
    ("sourceList", "source"),
    ("destinationList", "destination"),
    ("quantityList", "quantityElement"),
    ("childQuantityList", "quantityElement"),
    ("inputQuantityList", "quantityElement"),
    ("outputQuantityList", "quantityElement"),
    ("sensorElementList", "sensorElement"),
    ("correctiveEventIDs", "correctiveEventID"),
];

/// Fields whose scalar values carry numbers in the object form.
const NUMERIC_FIELDS: &[&str] = &[
    "quantity",
    "value",
    "minValue",
    "maxValue",
    "meanValue",
    "sDev",
    "percRank",
    "percValue",
];

fn entry_name_for(wrapper: &str) -> Option<&'static str> {
    LIST_WRAPPERS
        .iter()
        .find(|(name, _)| *name == wrapper)
        .map(|(_, entry)| *entry)
}

/// The default event-model collaborator: a statically-typed structural
/// binding with no reflection and no registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericEventModel;

impl GenericEventModel {
    /// Creates the model.
    pub const fn new() -> Self {
        Self
    }
}

impl EventModel for GenericEventModel {
    fn unmarshal_tag(&self, fragment: &XmlElement) -> Result<Event, ModelError> {
        let kind = EventKind::from_name(fragment.local_name()).ok_or_else(|| {
            ModelError::new(format!("unknown event type {:?}", fragment.name))
        })?;

        let mut members = vec![(
            "type".to_owned(),
            ObjectValue::String(kind.name().to_owned()),
        )];
        for (key, value) in &fragment.attributes {
            members.push((key.clone(), ObjectValue::String(value.clone())));
        }
        for child in fragment.child_elements() {
            members.push((json_name(child), map_field(child)));
        }
        let members = fold_repeats(members);

        let mut event = Event::new(kind, ObjectValue::Object(members));
        event.set_undeclared_prefixes(undeclared_tag_prefixes(fragment));
        Ok(event)
    }

    fn unmarshal_object(&self, node: &ObjectValue) -> Result<Event, ModelError> {
        let type_name = node
            .get("type")
            .and_then(ObjectValue::as_str)
            .ok_or_else(|| ModelError::new("event node has no type field"))?;
        let kind = EventKind::from_name(type_name)
            .ok_or_else(|| ModelError::new(format!("unknown event type {type_name:?}")))?;

        let members: Vec<(String, ObjectValue)> = node
            .as_object()
            .ok_or_else(|| ModelError::new("event node is not an object"))?
            .iter()
            .filter(|(key, _)| key != "@context")
            .cloned()
            .collect();

        let mut event = Event::new(kind, ObjectValue::Object(members));
        event.set_undeclared_prefixes(undeclared_object_prefixes(event.node()));
        Ok(event)
    }

    fn marshal_tag(&self, event: &Event) -> Result<XmlElement, ModelError> {
        let mut element = XmlElement::new(event.kind().name());
        let members = event
            .node()
            .as_object()
            .ok_or_else(|| ModelError::new("event payload is not an object"))?;
        for (key, value) in members {
            if key == "type" {
                continue;
            }
            append_member(&mut element, key, value);
        }
        Ok(element)
    }

    fn marshal_object(&self, event: &Event) -> Result<ObjectValue, ModelError> {
        Ok(event.node().clone())
    }
}

/// The object-form field name for an element: qualified names stay qualified,
/// plain names use the local part.
fn json_name(element: &XmlElement) -> String {
    element.name.clone()
}

fn scalar(local_name: &str, text: String) -> ObjectValue {
    if NUMERIC_FIELDS.contains(&local_name) {
        if let Ok(number) = text.parse::<f64>() {
            if let Some(number) = serde_json::Number::from_f64(number) {
                return ObjectValue::Number(number);
            }
        }
    }
    ObjectValue::String(text)
}

fn map_field(element: &XmlElement) -> ObjectValue {
    if entry_name_for(element.local_name()).is_some()
        && element.child_elements().next().is_some()
    {
        return ObjectValue::Array(element.child_elements().map(map_value).collect());
    }
    map_value(element)
}

fn map_value(element: &XmlElement) -> ObjectValue {
    let has_children = element.child_elements().next().is_some();
    if !has_children && element.attributes.is_empty() {
        return scalar(
            element.local_name(),
            element.text().unwrap_or_default(),
        );
    }

    let mut members: Vec<(String, ObjectValue)> = element
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), ObjectValue::String(v.clone())))
        .collect();

    if has_children {
        let children = element
            .child_elements()
            .map(|child| (json_name(child), map_field(child)))
            .collect();
        members.extend(fold_repeats(children));
    } else if let Some(text) = element.text() {
        members.push((json_name(element), scalar(element.local_name(), text)));
    }

    ObjectValue::Object(members)
}

/// Folds members sharing a name into one array-valued member, preserving
/// order of first occurrence.
fn fold_repeats(members: Vec<(String, ObjectValue)>) -> Vec<(String, ObjectValue)> {
    let mut out: Vec<(String, ObjectValue)> = Vec::with_capacity(members.len());
    for (key, value) in members {
        match out.iter_mut().find(|(k, _)| *k == key) {
            None => out.push((key, value)),
            Some((_, existing)) => match existing {
                ObjectValue::Array(items) => items.push(value),
                other => {
                    let first = std::mem::replace(other, ObjectValue::Null);
                    *other = ObjectValue::Array(vec![first, value]);
                }
            },
        }
    }
    out
}

fn append_member(parent: &mut XmlElement, key: &str, value: &ObjectValue) {
    match value {
        ObjectValue::Array(items) => {
            if let Some(entry) = entry_name_for(last_local(key)) {
                let mut wrapper = XmlElement::new(key);
                for item in items {
                    let child = value_to_element(entry, item);
                    wrapper.children.push(XmlNode::Element(child));
                }
                parent.children.push(XmlNode::Element(wrapper));
            } else {
                for item in items {
                    let child = value_to_element(key, item);
                    parent.children.push(XmlNode::Element(child));
                }
            }
        }
        ObjectValue::Null => {}
        _ => {
            let child = value_to_element(key, value);
            parent.children.push(XmlNode::Element(child));
        }
    }
}

fn value_to_element(name: &str, value: &ObjectValue) -> XmlElement {
    let mut element = XmlElement::new(name);
    match value {
        ObjectValue::Object(members) => {
            for (key, value) in members {
                let is_scalar = !matches!(value, ObjectValue::Object(_) | ObjectValue::Array(_));
                if (key == name || key == last_local(name)) && is_scalar {
                    element.children.push(XmlNode::Text(scalar_text(value)));
                } else if key == "type" && is_scalar {
                    element.attributes.push((key.clone(), scalar_text(value)));
                } else {
                    append_member(&mut element, key, value);
                }
            }
        }
        ObjectValue::Null => {}
        other => element.children.push(XmlNode::Text(scalar_text(other))),
    }
    element
}

fn scalar_text(value: &ObjectValue) -> String {
    match value {
        ObjectValue::String(s) => s.clone(),
        ObjectValue::Number(n) => n.to_string(),
        ObjectValue::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn last_local(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

/// Prefixes used by qualified names in the subtree with no declaration in the
/// subtree itself and no binding in the unmarshal scope.
fn undeclared_tag_prefixes(fragment: &XmlElement) -> Vec<String> {
    let mut declared: Vec<String> = Vec::new();
    let mut used: Vec<String> = Vec::new();
    collect_tag_prefixes(fragment, &mut declared, &mut used);
    filter_unresolved(used, &declared)
}

fn collect_tag_prefixes(element: &XmlElement, declared: &mut Vec<String>, used: &mut Vec<String>) {
    for (prefix, _) in &element.declarations {
        if !prefix.is_empty() && !declared.contains(prefix) {
            declared.push(prefix.clone());
        }
    }
    if let Some(prefix) = element.prefix() {
        if !used.iter().any(|p| p == prefix) {
            used.push(prefix.to_owned());
        }
    }
    for child in element.child_elements() {
        collect_tag_prefixes(child, declared, used);
    }
}

/// Prefixes used by qualified keys of the payload with no binding in the
/// unmarshal scope.
fn undeclared_object_prefixes(node: &ObjectValue) -> Vec<String> {
    let mut used: Vec<String> = Vec::new();
    collect_object_prefixes(node, &mut used);
    filter_unresolved(used, &[])
}

fn collect_object_prefixes(node: &ObjectValue, used: &mut Vec<String>) {
    if let Some(members) = node.as_object() {
        for (key, value) in members {
            // Full-IRI keys are not prefixed names.
            if let Some((prefix, rest)) = key.split_once(':') {
                if !rest.starts_with("//")
                    && !matches!(prefix, "urn" | "http" | "https")
                    && !used.iter().any(|p| p == prefix)
                {
                    used.push(prefix.to_owned());
                }
            }
            collect_object_prefixes(value, used);
        }
    } else if let Some(items) = node.as_array() {
        for item in items {
            collect_object_prefixes(item, used);
        }
    }
}

fn filter_unresolved(used: Vec<String>, declared: &[String]) -> Vec<String> {
    let scope = current_unmarshal_scope();
    used.into_iter()
        .filter(|prefix| {
            if declared.contains(prefix) {
                return false;
            }
            match &scope {
                Some(ctx) => ctx.resolve_prefix(prefix).is_none(),
                None => true,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use epcis_codecs::xml::TagReader;

    use crate::model::with_unmarshal_scope;
    use crate::namespace::NamespaceContext;

    use super::*;

    const EVENT_XML: &str = r#"
        <ObjectEvent>
          <eventTime>2023-01-01T00:00:00Z</eventTime>
          <eventTimeZoneOffset>+00:00</eventTimeZoneOffset>
          <epcList>
            <epc>urn:epc:id:sgtin:0614141.107346.2017</epc>
            <epc>urn:epc:id:sgtin:0614141.107346.2018</epc>
          </epcList>
          <action>OBSERVE</action>
          <bizTransactionList>
            <bizTransaction type="urn:epcglobal:cbv:btt:po">urn:epc:id:gdti:0614141.00001.1618034</bizTransaction>
          </bizTransactionList>
          <readPoint><id>urn:epc:id:sgln:0614141.00777.0</id></readPoint>
          <quantityList>
            <quantityElement>
              <epcClass>urn:epc:class:lgtin:4012345.012345.998877</epcClass>
              <quantity>200</quantity>
              <uom>KGM</uom>
            </quantityElement>
          </quantityList>
          <ex:custom xmlns:ex="https://example.com/ext">payload</ex:custom>
        </ObjectEvent>
    "#;

    fn parse_fragment(xml: &str) -> XmlElement {
        let mut reader = TagReader::from_bytes(xml.as_bytes());
        loop {
            match reader.next_event().unwrap() {
                epcis_codecs::xml::TagEvent::Start(start) => {
                    return reader.read_subtree(start).unwrap()
                }
                epcis_codecs::xml::TagEvent::Eof => panic!("no element"),
                _ => {}
            }
        }
    }

    #[test]
    fn tag_unmarshal_maps_lists_and_entries() {
        let fragment = parse_fragment(EVENT_XML);
        let event = GenericEventModel::new().unmarshal_tag(&fragment).unwrap();

        assert_eq!(event.kind(), EventKind::ObjectEvent);
        let node = event.node();
        assert_eq!(node.get("action").unwrap().as_str(), Some("OBSERVE"));

        let epcs = node.get("epcList").unwrap().as_array().unwrap();
        assert_eq!(epcs.len(), 2);
        assert_eq!(
            epcs[0].as_str(),
            Some("urn:epc:id:sgtin:0614141.107346.2017")
        );

        let txns = node.get("bizTransactionList").unwrap().as_array().unwrap();
        assert_eq!(
            txns[0].get("type").unwrap().as_str(),
            Some("urn:epcglobal:cbv:btt:po")
        );
        assert_eq!(
            txns[0].get("bizTransaction").unwrap().as_str(),
            Some("urn:epc:id:gdti:0614141.00001.1618034")
        );

        let read_point = node.get("readPoint").unwrap();
        assert_eq!(
            read_point.get("id").unwrap().as_str(),
            Some("urn:epc:id:sgln:0614141.00777.0")
        );

        let quantity = &node.get("quantityList").unwrap().as_array().unwrap()[0];
        assert_eq!(
            quantity.get("quantity").unwrap(),
            &ObjectValue::Number(serde_json::Number::from_f64(200.0).unwrap())
        );

        assert_eq!(node.get("ex:custom").unwrap().as_str(), Some("payload"));
    }

    #[test]
    fn marshal_tag_round_trips_structure() {
        let fragment = parse_fragment(EVENT_XML);
        let model = GenericEventModel::new();
        let event = model.unmarshal_tag(&fragment).unwrap();
        let back = model.marshal_tag(&event).unwrap();

        assert_eq!(back.name, "ObjectEvent");
        let epc_list = back
            .child_elements()
            .find(|el| el.name == "epcList")
            .unwrap();
        assert_eq!(epc_list.child_elements().count(), 2);
        assert!(epc_list
            .child_elements()
            .all(|el| el.name == "epc" && el.text().is_some()));

        let txn_list = back
            .child_elements()
            .find(|el| el.name == "bizTransactionList")
            .unwrap();
        let txn = txn_list.child_elements().next().unwrap();
        assert_eq!(txn.attribute("type"), Some("urn:epcglobal:cbv:btt:po"));
        assert_eq!(txn.text(), Some("urn:epc:id:gdti:0614141.00001.1618034".into()));

        let read_point = back
            .child_elements()
            .find(|el| el.name == "readPoint")
            .unwrap();
        assert!(read_point.child_elements().any(|el| el.name == "id"));
    }

    #[test]
    fn object_unmarshal_strips_context_and_flags_unknown_prefixes() {
        let node = ObjectValue::from_slice(
            br#"{"type":"ObjectEvent","@context":{"ex":"https://example.com/"},
                "action":"ADD","ex:field":"v","mystery:field":"w"}"#,
        )
        .unwrap();

        let mut ctx = NamespaceContext::new();
        ctx.put_event("https://example.com/", "ex");
        let event = with_unmarshal_scope(Arc::new(ctx), || {
            GenericEventModel::new().unmarshal_object(&node).unwrap()
        });

        assert!(event.node().get("@context").is_none());
        assert_eq!(event.undeclared_prefixes(), ["mystery".to_owned()]);
    }

    #[test]
    fn unknown_event_type_is_an_error() {
        let node = ObjectValue::from_slice(br#"{"type":"WeirdEvent"}"#).unwrap();
        assert!(GenericEventModel::new().unmarshal_object(&node).is_err());

        let fragment = XmlElement::new("WeirdEvent");
        assert!(GenericEventModel::new().unmarshal_tag(&fragment).is_err());
    }

    #[test]
    fn persistent_disposition_round_trips_as_repeated_elements() {
        let node = ObjectValue::from_slice(
            br#"{"type":"ObjectEvent","persistentDisposition":{
                "set":["urn:epcglobal:cbv:disp:completeness_verified"],
                "unset":["urn:epcglobal:cbv:disp:completeness_inferred"]}}"#,
        )
        .unwrap();
        let model = GenericEventModel::new();
        let event = model.unmarshal_object(&node).unwrap();
        let element = model.marshal_tag(&event).unwrap();

        let disposition = element
            .child_elements()
            .find(|el| el.name == "persistentDisposition")
            .unwrap();
        assert!(disposition.child_elements().any(|el| el.name == "set"));
        assert!(disposition.child_elements().any(|el| el.name == "unset"));
    }
}
