//! Class resolution
//!
//! A profile may carry a `classes` list naming reusable fragments:
//!
//! ```xml
//! <classes config:type="list">
//!   <class>
//!     <class_name>swap</class_name>
//!     <configuration>largeswap.xml</configuration>
//!     <dont_merge config:type="list">
//!       <element>partition</element>
//!     </dont_merge>
//!   </class>
//! </classes>
//! ```
//!
//! Each class lives at `<classes_dir>/<class_name>/<configuration>`, relative
//! to the profile location.

use crate::error::{AutoinstError, Result};
use crate::fetch::{FragmentFetcher, FragmentRef, Location};
use crate::profile::xml::bytes_to_hash;
use crate::profile::{ProfileDocument, ProfileValue};
use tracing::{debug, info};

pub const DEFAULT_CLASSES_DIR: &str = "classes";

/// One entry of the `classes` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDefinition {
    pub class_name: String,
    pub configuration: FragmentRef,
    /// Keys whose base value must survive this class's merge
    pub dont_merge: Vec<String>,
}

/// What the profile says about classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassSection {
    /// No `classes` key at all
    NoClassesSection,
    /// `classes` present with no entries
    EmptyClassesList,
    Classes(Vec<ClassDefinition>),
}

impl ClassSection {
    /// Classes to merge; empty for both absent variants.
    pub fn definitions(&self) -> &[ClassDefinition] {
        match self {
            Self::Classes(classes) => classes,
            Self::NoClassesSection | Self::EmptyClassesList => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassResolver {
    classes_dir: String,
}

impl Default for ClassResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CLASSES_DIR)
    }
}

impl ClassResolver {
    pub fn new(classes_dir: impl Into<String>) -> Self {
        let classes_dir: String = classes_dir.into();
        Self {
            classes_dir: classes_dir.trim_end_matches('/').to_string(),
        }
    }

    /// Read the `classes` section of a profile.
    pub fn resolve(&self, profile: &ProfileDocument) -> Result<ClassSection> {
        let Some(section) = profile.get("classes") else {
            return Ok(ClassSection::NoClassesSection);
        };

        let entries = match section {
            ProfileValue::List(entries) => entries.as_slice(),
            // `<classes/>` parses as an empty string
            ProfileValue::String(text) if text.trim().is_empty() => &[],
            ProfileValue::Map(map) if map.is_empty() => &[],
            other => {
                return Err(AutoinstError::parse(
                    "classes",
                    format!("expected a list, found {}", other.kind()),
                ));
            }
        };

        if entries.is_empty() {
            return Ok(ClassSection::EmptyClassesList);
        }

        let classes = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| parse_class(index, entry))
            .collect::<Result<Vec<_>>>()?;
        info!("Profile declares {} classes", classes.len());
        Ok(ClassSection::Classes(classes))
    }

    /// Location of a class fragment relative to `base`.
    pub fn location(&self, class: &ClassDefinition, base: &Location) -> Result<Location> {
        let configuration = class.configuration.as_str();
        if configuration.contains("://") {
            return class.configuration.resolve(base);
        }
        let reference = FragmentRef::new(format!(
            "{}/{}/{}",
            self.classes_dir, class.class_name, configuration
        ));
        reference.resolve(base)
    }

    /// Fetch and parse every class, in declaration order.
    ///
    /// Stops at the first fetch or parse failure.
    pub fn fetch(
        &self,
        classes: &[ClassDefinition],
        fetcher: &dyn FragmentFetcher,
        base: &Location,
    ) -> Result<Vec<(ClassDefinition, ProfileDocument)>> {
        let mut fragments = Vec::with_capacity(classes.len());
        for class in classes {
            let location = self.location(class, base)?;
            debug!("Fetching class {} from {}", class.class_name, location);
            let bytes = fetcher.fetch(&location)?;
            let document = bytes_to_hash(&bytes, &format!("class {}", class.class_name))?;
            fragments.push((class.clone(), document));
        }
        Ok(fragments)
    }
}

fn parse_class(index: usize, entry: &ProfileValue) -> Result<ClassDefinition> {
    let what = format!("class #{}", index + 1);
    let map = entry
        .as_map()
        .ok_or_else(|| AutoinstError::parse(&what, format!("expected a map, found {}", entry.kind())))?;

    let text = |key: &str| -> Result<String> {
        map.get(key)
            .and_then(ProfileValue::to_scalar_string)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AutoinstError::parse(&what, format!("missing <{}>", key)))
    };

    let class_name = text("class_name")?;
    let configuration = FragmentRef::new(text("configuration")?);

    let dont_merge = match map.get("dont_merge") {
        None => Vec::new(),
        Some(ProfileValue::List(keys)) => keys
            .iter()
            .filter_map(ProfileValue::to_scalar_string)
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect(),
        Some(other) => match other.to_scalar_string() {
            Some(single) if !single.trim().is_empty() => vec![single.trim().to_string()],
            _ => Vec::new(),
        },
    };

    Ok(ClassDefinition {
        class_name,
        configuration,
        dont_merge,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFetcher;
    use crate::profile::xml_to_hash;

    const PROFILE: &str = r#"<?xml version="1.0"?>
<profile xmlns="http://www.suse.com/1.0/yast2ns" xmlns:config="http://www.suse.com/1.0/configns">
  <classes config:type="list">
    <class>
      <class_name>swap</class_name>
      <configuration>largeswap.xml</configuration>
      <dont_merge config:type="list">
        <element>partition</element>
      </dont_merge>
    </class>
    <class>
      <class_name>users</class_name>
      <configuration>admins.xml</configuration>
    </class>
  </classes>
</profile>"#;

    #[test]
    fn test_resolve_classes() {
        let profile = xml_to_hash(PROFILE).unwrap();
        let section = ClassResolver::default().resolve(&profile).unwrap();
        let ClassSection::Classes(classes) = section else {
            panic!("expected classes, got {:?}", section);
        };
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[0].class_name, "swap");
        assert_eq!(classes[0].configuration.as_str(), "largeswap.xml");
        assert_eq!(classes[0].dont_merge, vec!["partition"]);
        assert!(classes[1].dont_merge.is_empty());
    }

    #[test]
    fn test_absent_and_empty_sections_differ() {
        let resolver = ClassResolver::default();

        let without = xml_to_hash("<profile><keyboard>us</keyboard></profile>").unwrap();
        assert_eq!(resolver.resolve(&without).unwrap(), ClassSection::NoClassesSection);

        let empty = xml_to_hash(
            r#"<profile xmlns:config="http://www.suse.com/1.0/configns"><classes config:type="list"/></profile>"#,
        )
        .unwrap();
        assert_eq!(resolver.resolve(&empty).unwrap(), ClassSection::EmptyClassesList);
        assert!(resolver.resolve(&empty).unwrap().definitions().is_empty());
    }

    #[test]
    fn test_malformed_class_is_parse_error() {
        let profile = xml_to_hash(
            r#"<profile xmlns:config="http://www.suse.com/1.0/configns">
                 <classes config:type="list"><class><class_name>swap</class_name></class></classes>
               </profile>"#,
        )
        .unwrap();
        let err = ClassResolver::default().resolve(&profile).unwrap_err();
        assert!(matches!(err, AutoinstError::Parse { .. }));
        assert!(err.to_string().contains("configuration"));
    }

    #[test]
    fn test_location_below_classes_dir() {
        let base = Location::parse("http://server/profiles/autoinst.xml").unwrap();
        let class = ClassDefinition {
            class_name: "swap".to_string(),
            configuration: FragmentRef::new("largeswap.xml"),
            dont_merge: vec![],
        };
        assert_eq!(
            ClassResolver::new("classes/").location(&class, &base).unwrap().url(),
            "http://server/profiles/classes/swap/largeswap.xml"
        );
        assert_eq!(
            ClassResolver::new("/srv/classes").location(&class, &base).unwrap().url(),
            "http://server/srv/classes/swap/largeswap.xml"
        );
    }

    #[test]
    fn test_fetch_in_declaration_order() {
        let profile = xml_to_hash(PROFILE).unwrap();
        let resolver = ClassResolver::default();
        let section = resolver.resolve(&profile).unwrap();

        let fetcher = MemoryFetcher::new()
            .with("http://server/classes/swap/largeswap.xml", "<profile><swap>8G</swap></profile>")
            .with("http://server/classes/users/admins.xml", "<profile><admin>root</admin></profile>");
        let base = Location::parse("http://server/autoinst.xml").unwrap();

        let fragments = resolver.fetch(section.definitions(), &fetcher, &base).unwrap();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].0.class_name, "swap");
        assert_eq!(fragments[0].1["swap"], ProfileValue::from("8G"));
        assert_eq!(fragments[1].1["admin"], ProfileValue::from("root"));
        assert_eq!(
            fetcher.requests(),
            vec![
                "http://server/classes/swap/largeswap.xml",
                "http://server/classes/users/admins.xml"
            ]
        );
    }

    #[test]
    fn test_fetch_stops_at_first_failure() {
        let profile = xml_to_hash(PROFILE).unwrap();
        let resolver = ClassResolver::default();
        let section = resolver.resolve(&profile).unwrap();
        let fetcher = MemoryFetcher::new();
        let base = Location::parse("http://server/autoinst.xml").unwrap();

        let err = resolver.fetch(section.definitions(), &fetcher, &base).unwrap_err();
        assert!(matches!(err, AutoinstError::Fetch { .. }));
        assert_eq!(fetcher.requests().len(), 1);
    }
}
