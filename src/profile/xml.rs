//! XML ⇄ profile conversion.
//!
//! Profiles use the YaST XML conventions: scalar type and list-ness are
//! carried by a `config:type` attribute in the config namespace.
//!
//! | XML shape                                   | ProfileValue    |
//! |---------------------------------------------|-----------------|
//! | `<k>text</k>`, `<k/>`                       | `String`        |
//! | `<k config:type="integer">5</k>`            | `Int`           |
//! | `<k config:type="boolean">true</k>`         | `Bool`          |
//! | `<k config:type="list"><e>..</e></k>`       | `List`          |
//! | `<k><a>..</a><b>..</b></k>`                 | `Map`           |
//! | `<k config:type="map"/>`                    | empty `Map`     |
//!
//! List entry element names are ignored when reading. When writing, entries
//! of well-known lists get their usual names (`partitions` → `partition`,
//! `dont_merge` → `element`), all others are written as `listentry`.
//!
//! Keys are written as element names, so every key must be an XML name
//! without a namespace prefix. [`hash_to_xml`] rejects documents that break
//! this instead of emitting malformed XML.

use super::{ProfileDocument, ProfileValue};
use crate::error::{AutoinstError, Result};
use roxmltree::{Document, Node, ParsingOptions};
use std::fmt::Write as _;

/// Default namespace of profile documents.
pub const YAST_NS: &str = "http://www.suse.com/1.0/yast2ns";
/// Namespace of the `config:type` attribute.
pub const CONFIG_NS: &str = "http://www.suse.com/1.0/configns";

const LIST_ENTRY: &str = "listentry";

/// Parse an XML document into a profile, dropping the root element name.
pub fn xml_to_hash(xml: &str) -> Result<ProfileDocument> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let doc = Document::parse_with_options(xml, options)
        .map_err(|e| AutoinstError::parse("XML document", e.to_string()))?;

    match node_value(doc.root_element())? {
        ProfileValue::Map(map) => Ok(map),
        ProfileValue::String(text) if text.trim().is_empty() => Ok(ProfileDocument::new()),
        other => Err(AutoinstError::parse(
            "XML document",
            format!(
                "root element <{}> holds a {}, expected a map",
                doc.root_element().tag_name().name(),
                other.kind()
            ),
        )),
    }
}

/// Parse raw bytes (as returned by a fetcher) into a profile.
pub fn bytes_to_hash(bytes: &[u8], what: &str) -> Result<ProfileDocument> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| AutoinstError::parse(what, format!("not valid UTF-8: {}", e)))?;
    xml_to_hash(text).map_err(|e| match e {
        AutoinstError::Parse { reason, .. } => AutoinstError::parse(what, reason),
        other => other,
    })
}

/// Serialize a profile under the given root element name.
///
/// Fails with [`AutoinstError::InvalidElementName`] when the root or any key
/// is not a valid element name.
pub fn hash_to_xml(document: &ProfileDocument, root: &str) -> Result<String> {
    check_name(root)?;
    check_names(document)?;

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\"?>\n");
    let _ = write!(
        out,
        "<{root} xmlns=\"{YAST_NS}\" xmlns:config=\"{CONFIG_NS}\">\n"
    );
    for (key, value) in document {
        write_element(&mut out, key, value, 1);
    }
    let _ = writeln!(out, "</{root}>");
    Ok(out)
}

/// `Name` production of XML 1.0, restricted to unprefixed names.
fn is_element_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_alphabetic() || first == '_') {
        return false;
    }
    if name.get(..3).is_some_and(|prefix| prefix.eq_ignore_ascii_case("xml")) {
        return false;
    }
    chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn check_name(name: &str) -> Result<()> {
    if is_element_name(name) {
        Ok(())
    } else {
        Err(AutoinstError::InvalidElementName(name.to_string()))
    }
}

fn check_names(map: &ProfileDocument) -> Result<()> {
    for (key, value) in map {
        check_name(key)?;
        check_value(value)?;
    }
    Ok(())
}

fn check_value(value: &ProfileValue) -> Result<()> {
    match value {
        ProfileValue::Map(map) => check_names(map),
        ProfileValue::List(items) => items.iter().try_for_each(check_value),
        _ => Ok(()),
    }
}

fn config_type<'a>(node: Node<'a, '_>) -> Option<&'a str> {
    node.attributes()
        .find(|attr| {
            attr.name() == "type" && matches!(attr.namespace(), Some(CONFIG_NS) | None)
        })
        .map(|attr| attr.value())
}

fn node_text(node: Node<'_, '_>) -> String {
    node.children()
        .filter(|child| child.is_text())
        .filter_map(|child| child.text())
        .collect()
}

fn node_value(node: Node<'_, '_>) -> Result<ProfileValue> {
    let name = node.tag_name().name();
    let elements: Vec<Node<'_, '_>> = node.children().filter(|c| c.is_element()).collect();

    match config_type(node) {
        Some("list") => elements
            .into_iter()
            .map(node_value)
            .collect::<Result<Vec<_>>>()
            .map(ProfileValue::List),
        Some("integer") => {
            let text = node_text(node);
            text.trim()
                .parse::<i64>()
                .map(ProfileValue::Int)
                .map_err(|e| {
                    AutoinstError::parse("XML document", format!("<{}>: bad integer {:?}: {}", name, text, e))
                })
        }
        Some("boolean") => match node_text(node).trim() {
            "true" => Ok(ProfileValue::Bool(true)),
            "false" => Ok(ProfileValue::Bool(false)),
            other => Err(AutoinstError::parse(
                "XML document",
                format!("<{}>: bad boolean {:?}", name, other),
            )),
        },
        Some("map") => map_value(elements),
        // Untyped and `symbol`/`string` typed elements
        _ => {
            if elements.is_empty() {
                Ok(ProfileValue::String(node_text(node)))
            } else {
                map_value(elements)
            }
        }
    }
}

fn map_value(elements: Vec<Node<'_, '_>>) -> Result<ProfileValue> {
    let mut map = ProfileDocument::new();
    for element in elements {
        let key = element.tag_name().name().to_string();
        let value = node_value(element)?;
        if map.insert(key.clone(), value).is_some() {
            tracing::debug!("Duplicate element <{}> in map, keeping the last one", key);
        }
    }
    Ok(ProfileValue::Map(map))
}

fn list_entry_name(key: &str) -> &'static str {
    match key {
        "rules" => "rule",
        "classes" => "class",
        "dont_merge" => "element",
        "partitioning" => "drive",
        "partitions" => "partition",
        "users" => "user",
        "groups" => "group",
        "packages" => "package",
        "patterns" => "pattern",
        "interfaces" => "interface",
        "pre-scripts" | "post-scripts" | "chroot-scripts" | "init-scripts" => "script",
        _ => LIST_ENTRY,
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn write_element(out: &mut String, key: &str, value: &ProfileValue, depth: usize) {
    indent(out, depth);
    match value {
        ProfileValue::String(s) if s.is_empty() => {
            let _ = writeln!(out, "<{key}/>");
        }
        ProfileValue::String(s) => {
            let _ = writeln!(out, "<{key}>{}</{key}>", escape(s));
        }
        ProfileValue::Int(i) => {
            let _ = writeln!(out, "<{key} config:type=\"integer\">{i}</{key}>");
        }
        ProfileValue::Bool(b) => {
            let _ = writeln!(out, "<{key} config:type=\"boolean\">{b}</{key}>");
        }
        ProfileValue::List(items) if items.is_empty() => {
            let _ = writeln!(out, "<{key} config:type=\"list\"/>");
        }
        ProfileValue::List(items) => {
            let _ = writeln!(out, "<{key} config:type=\"list\">");
            let entry = list_entry_name(key);
            for item in items {
                write_element(out, entry, item, depth + 1);
            }
            indent(out, depth);
            let _ = writeln!(out, "</{key}>");
        }
        ProfileValue::Map(map) if map.is_empty() => {
            let _ = writeln!(out, "<{key} config:type=\"map\"/>");
        }
        ProfileValue::Map(map) => {
            let _ = writeln!(out, "<{key}>");
            for (child_key, child) in map {
                write_element(out, child_key, child, depth + 1);
            }
            indent(out, depth);
            let _ = writeln!(out, "</{key}>");
        }
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            // Carriage returns would be normalized away by the parser
            '\r' => escaped.push_str("&#13;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::map;

    const PROFILE: &str = r#"<?xml version="1.0"?>
<!DOCTYPE profile>
<profile xmlns="http://www.suse.com/1.0/yast2ns" xmlns:config="http://www.suse.com/1.0/configns">
  <general>
    <mode>
      <confirm config:type="boolean">false</confirm>
    </mode>
  </general>
  <partitioning config:type="list">
    <drive>
      <device>/dev/sda</device>
      <partitions config:type="list">
        <partition>
          <size>auto</size>
          <partition_nr config:type="integer">1</partition_nr>
        </partition>
      </partitions>
    </drive>
  </partitioning>
  <scripts>
    <init-scripts config:type="list">
      <script><source><![CDATA[echo "a & b" > /tmp/x]]></source></script>
    </init-scripts>
  </scripts>
  <software config:type="map"/>
  <hostname/>
</profile>
"#;

    #[test]
    fn test_parse_typed_elements() {
        let doc = xml_to_hash(PROFILE).expect("profile should parse");

        let confirm = &doc["general"].as_map().unwrap()["mode"].as_map().unwrap()["confirm"];
        assert_eq!(confirm, &ProfileValue::Bool(false));

        let drives = doc["partitioning"].as_list().unwrap();
        assert_eq!(drives.len(), 1);
        let drive = drives[0].as_map().unwrap();
        assert_eq!(drive["device"], ProfileValue::from("/dev/sda"));
        let partition = drive["partitions"].as_list().unwrap()[0].as_map().unwrap();
        assert_eq!(partition["partition_nr"], ProfileValue::Int(1));

        assert_eq!(doc["software"], ProfileValue::Map(ProfileDocument::new()));
        assert_eq!(doc["hostname"], ProfileValue::from(""));
    }

    #[test]
    fn test_cdata_is_unescaped_text() {
        let doc = xml_to_hash(PROFILE).unwrap();
        let scripts = doc["scripts"].as_map().unwrap()["init-scripts"].as_list().unwrap();
        let source = &scripts[0].as_map().unwrap()["source"];
        assert_eq!(source.as_str(), Some("echo \"a & b\" > /tmp/x"));
    }

    #[test]
    fn test_malformed_xml_is_parse_error() {
        let err = xml_to_hash("<profile><general></profile>").unwrap_err();
        assert!(matches!(err, AutoinstError::Parse { .. }));
    }

    #[test]
    fn test_bad_integer_is_parse_error() {
        let xml = r#"<profile xmlns:config="http://www.suse.com/1.0/configns"><n config:type="integer">x</n></profile>"#;
        assert!(matches!(xml_to_hash(xml), Err(AutoinstError::Parse { .. })));
    }

    #[test]
    fn test_scalar_root_is_rejected() {
        let xml = r#"<profile xmlns:config="http://www.suse.com/1.0/configns" config:type="integer">3</profile>"#;
        assert!(xml_to_hash(xml).is_err());
        // An empty root is an empty profile
        assert!(xml_to_hash("<profile/>").unwrap().is_empty());
    }

    #[test]
    fn test_serialize_then_parse_preserves_document() {
        let doc = map([
            (
                "partitions",
                ProfileValue::List(vec![
                    ProfileValue::Map(map([("device", "/dev/sda")])),
                    ProfileValue::Map(map([("size", ProfileValue::Int(2048))])),
                ]),
            ),
            ("note", ProfileValue::from("<tag> & 'quote'\r\n")),
            ("empty", ProfileValue::List(vec![])),
        ]);
        let xml = hash_to_xml(&doc, "profile").unwrap();
        assert!(xml.contains("<partition>"));
        assert_eq!(xml_to_hash(&xml).unwrap(), doc);
    }

    #[test]
    fn test_list_entry_names() {
        assert_eq!(list_entry_name("partitions"), "partition");
        assert_eq!(list_entry_name("rules"), "rule");
        assert_eq!(list_entry_name("classes"), "class");
        assert_eq!(list_entry_name("dont_merge"), "element");
        assert_eq!(list_entry_name("post-scripts"), "script");
        assert_eq!(list_entry_name("addresses"), "listentry");
        assert_eq!(list_entry_name("s"), "listentry");
    }

    #[test]
    fn test_unknown_list_is_written_as_listentry() {
        let doc = map([("addresses", ProfileValue::List(vec![ProfileValue::from("10.0.0.1")]))]);
        let xml = hash_to_xml(&doc, "profile").unwrap();
        assert!(xml.contains("<listentry>10.0.0.1</listentry>"));
        assert!(!xml.contains("<addresse>"));
    }

    #[test]
    fn test_invalid_element_names_are_rejected() {
        let nested = map([("network", ProfileValue::Map(map([("dns server", "10.0.0.1")])))]);
        assert!(matches!(
            hash_to_xml(&nested, "profile"),
            Err(AutoinstError::InvalidElementName(name)) if name == "dns server"
        ));

        let in_list = map([(
            "partitions",
            ProfileValue::List(vec![ProfileValue::Map(map([("1size", "2G")]))]),
        )]);
        assert!(hash_to_xml(&in_list, "profile").is_err());

        for bad in ["", "a:b", "xmlfoo", "-lead", "a<b"] {
            assert!(!is_element_name(bad), "{bad:?} should be rejected");
        }
        for good in ["keyboard", "pre-scripts", "_x", "v1.2"] {
            assert!(is_element_name(good), "{good:?} should be accepted");
        }

        assert!(hash_to_xml(&ProfileDocument::new(), "my profile").is_err());
    }
}
