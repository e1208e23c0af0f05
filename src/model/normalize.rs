//! Identifier normalization between the EPC URN form and the GS1 Digital
//! Link form, applied per event through the router's normalizer callback.

use std::sync::Arc;

use epcis_codecs::decoding::format::ObjectValue;

use crate::namespace::NamespaceContext;

use super::Event;

/// A per-event transform applied after stamping and before serialization.
pub type Normalizer = Arc<dyn Fn(Event, &NamespaceContext) -> Event + Send + Sync>;

/// Fields whose string values carry item identifiers.
const IDENTIFIER_FIELDS: &[&str] = &[
    "epcList",
    "childEPCs",
    "inputEPCList",
    "outputEPCList",
    "parentID",
    "epcClass",
];

const DIGITAL_LINK_HOST: &str = "https://id.gs1.org";

/// Company-prefix length assumed when decomposing a Digital Link key back
/// into a URN. Real deployments derive this from the GS1 company-prefix
/// tables; the stock normalizer uses a fixed length.
const DEFAULT_COMPANY_PREFIX_LEN: usize = 7;

/// A normalizer rewriting identifiers into the GS1 Digital Link form.
pub fn digital_link_normalizer() -> Normalizer {
    Arc::new(|mut event, _ns| {
        rewrite_identifiers(event.node_mut(), &urn_to_digital_link);
        event
    })
}

/// A normalizer rewriting identifiers into the legacy URN form.
pub fn urn_normalizer() -> Normalizer {
    Arc::new(|mut event, _ns| {
        rewrite_identifiers(event.node_mut(), &digital_link_to_urn);
        event
    })
}

/// A normalizer that leaves every identifier untouched.
pub fn identity_normalizer() -> Normalizer {
    Arc::new(|event, _ns| event)
}

fn rewrite_identifiers(node: &mut ObjectValue, translate: &dyn Fn(&str) -> Option<String>) {
    if let ObjectValue::Object(members) = node {
        for (key, value) in members.iter_mut() {
            if IDENTIFIER_FIELDS.contains(&key.as_str()) {
                rewrite_value(value, translate);
            } else if matches!(value, ObjectValue::Object(_) | ObjectValue::Array(_)) {
                rewrite_identifiers(value, translate);
            }
        }
    } else if let ObjectValue::Array(items) = node {
        for item in items {
            rewrite_identifiers(item, translate);
        }
    }
}

fn rewrite_value(value: &mut ObjectValue, translate: &dyn Fn(&str) -> Option<String>) {
    match value {
        ObjectValue::String(text) => {
            if let Some(rewritten) = translate(text) {
                *text = rewritten;
            }
        }
        ObjectValue::Array(items) => {
            for item in items {
                rewrite_value(item, translate);
            }
        }
        _ => {}
    }
}

fn all_digits(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}

/// GS1 mod-10 check digit over the given digits.
fn check_digit(digits: &str) -> Option<char> {
    let mut sum = 0u32;
    for (i, ch) in digits.chars().rev().enumerate() {
        let d = ch.to_digit(10)?;
        sum += if i % 2 == 0 { d * 3 } else { d };
    }
    char::from_digit((10 - sum % 10) % 10, 10)
}

fn urn_to_digital_link(urn: &str) -> Option<String> {
    let rest = urn.strip_prefix("urn:epc:id:")?;
    let (scheme, body) = rest.split_once(':')?;
    let parts: Vec<&str> = body.split('.').collect();
    match (scheme, parts.as_slice()) {
        ("sgtin", [company, item, serial]) => {
            let indicator = item.chars().next()?;
            let digits = format!("{indicator}{company}{}", &item[1..]);
            let check = check_digit(&digits)?;
            Some(format!(
                "{DIGITAL_LINK_HOST}/01/{digits}{check}/21/{serial}"
            ))
        }
        ("sscc", [company, serial]) => {
            let extension = serial.chars().next()?;
            let digits = format!("{extension}{company}{}", &serial[1..]);
            let check = check_digit(&digits)?;
            Some(format!("{DIGITAL_LINK_HOST}/00/{digits}{check}"))
        }
        ("sgln", [company, location, extension]) => {
            let digits = format!("{company}{location}");
            let check = check_digit(&digits)?;
            let base = format!("{DIGITAL_LINK_HOST}/414/{digits}{check}");
            if *extension == "0" {
                Some(base)
            } else {
                Some(format!("{base}/254/{extension}"))
            }
        }
        ("grai", [company, asset, serial]) => {
            let digits = format!("{company}{asset}");
            let check = check_digit(&digits)?;
            Some(format!("{DIGITAL_LINK_HOST}/8003/0{digits}{check}{serial}"))
        }
        ("giai", [company, asset]) => {
            Some(format!("{DIGITAL_LINK_HOST}/8004/{company}{asset}"))
        }
        _ => None,
    }
}

fn digital_link_to_urn(link: &str) -> Option<String> {
    let path = link
        .strip_prefix("https://")
        .or_else(|| link.strip_prefix("http://"))?
        .split_once('/')
        .map(|(_, path)| path)?;
    let segments: Vec<&str> = path.split('/').collect();
    let n = DEFAULT_COMPANY_PREFIX_LEN;
    match segments.as_slice() {
        ["01", gtin, "21", serial] if gtin.len() == 14 && all_digits(gtin) => {
            let indicator = &gtin[..1];
            let company = &gtin[1..1 + n];
            let item = &gtin[1 + n..13];
            Some(format!("urn:epc:id:sgtin:{company}.{indicator}{item}.{serial}"))
        }
        ["00", sscc] if sscc.len() == 18 && all_digits(sscc) => {
            let extension = &sscc[..1];
            let company = &sscc[1..1 + n];
            let serial = &sscc[1 + n..17];
            Some(format!("urn:epc:id:sscc:{company}.{extension}{serial}"))
        }
        ["414", gln] if gln.len() == 13 && all_digits(gln) => {
            let company = &gln[..n];
            let location = &gln[n..12];
            Some(format!("urn:epc:id:sgln:{company}.{location}.0"))
        }
        ["414", gln, "254", extension] if gln.len() == 13 && all_digits(gln) => {
            let company = &gln[..n];
            let location = &gln[n..12];
            Some(format!("urn:epc:id:sgln:{company}.{location}.{extension}"))
        }
        ["8004", giai] if giai.len() > n && giai.is_ascii() => {
            let company = &giai[..n];
            let asset = &giai[n..];
            Some(format!("urn:epc:id:giai:{company}.{asset}"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use epcis_codecs::decoding::format::EventKind;

    use super::*;

    #[test]
    fn check_digit_matches_known_gtin() {
        // GTIN-14 00614141073467 has check digit 7 over 0061414107346.
        assert_eq!(check_digit("0061414107346"), Some('7'));
    }

    #[test]
    fn sgtin_urn_to_digital_link_and_back() {
        let urn = "urn:epc:id:sgtin:0614141.107346.2017";
        let link = urn_to_digital_link(urn).unwrap();
        assert!(link.starts_with("https://id.gs1.org/01/"));
        assert!(link.ends_with("/21/2017"));

        let back = digital_link_to_urn(&link).unwrap();
        assert_eq!(back, urn);
    }

    #[test]
    fn sscc_round_trip() {
        let urn = "urn:epc:id:sscc:0614141.1234567890";
        let link = urn_to_digital_link(urn).unwrap();
        let back = digital_link_to_urn(&link).unwrap();
        assert_eq!(back, urn);
    }

    #[test]
    fn unknown_schemes_pass_through() {
        assert_eq!(urn_to_digital_link("urn:epc:id:unknown:1.2"), None);
        assert_eq!(digital_link_to_urn("https://example.com/whatever"), None);
    }

    #[test]
    fn normalizer_rewrites_identifier_fields_only() {
        let node = ObjectValue::from_slice(
            br#"{"type":"ObjectEvent",
                "epcList":["urn:epc:id:sgtin:0614141.107346.2017"],
                "bizStep":"urn:epcglobal:cbv:bizstep:shipping"}"#,
        )
        .unwrap();
        let event = Event::new(EventKind::ObjectEvent, node);
        let ns = NamespaceContext::new();

        let event = digital_link_normalizer()(event, &ns);
        let epcs = event.node().get("epcList").unwrap().as_array().unwrap();
        assert!(epcs[0].as_str().unwrap().starts_with("https://id.gs1.org/01/"));
        // Non-identifier vocabulary is untouched.
        assert_eq!(
            event.node().get("bizStep").unwrap().as_str(),
            Some("urn:epcglobal:cbv:bizstep:shipping")
        );
    }
}
