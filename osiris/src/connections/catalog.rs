use super::ConnError;
use crate::canon;
use std::collections::BTreeMap;

/// `family -> alias -> descriptor`, loaded from the connection YAML.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionCatalog {
    families: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl ConnectionCatalog {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConnError> {
        let raw: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        let as_json = canon::yaml_to_json(raw)?;
        Self::from_value(as_json)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ConnError> {
        let serde_json::Value::Object(families_raw) = value else {
            return Err(ConnError::Catalog("catalog root must be a mapping".into()));
        };

        let mut families = BTreeMap::new();
        for (family, aliases_raw) in families_raw {
            let serde_json::Value::Object(aliases_raw) = aliases_raw else {
                return Err(ConnError::Catalog(format!(
                    "family `{family}` must map aliases to descriptors"
                )));
            };
            let mut aliases = BTreeMap::new();
            let mut default_count = 0usize;
            for (alias, descriptor) in aliases_raw {
                if !descriptor.is_object() {
                    return Err(ConnError::Catalog(format!(
                        "descriptor `{family}.{alias}` must be a mapping"
                    )));
                }
                if descriptor.get("default") == Some(&serde_json::Value::Bool(true)) {
                    default_count += 1;
                }
                aliases.insert(alias, descriptor);
            }
            if default_count > 1 {
                return Err(ConnError::Catalog(format!(
                    "family `{family}` declares more than one default alias"
                )));
            }
            families.insert(family, aliases);
        }
        Ok(Self { families })
    }

    pub fn descriptor(&self, family: &str, alias: &str) -> Result<&serde_json::Value, ConnError> {
        let aliases = self
            .families
            .get(family)
            .ok_or_else(|| ConnError::UnknownFamily(family.to_string()))?;
        aliases.get(alias).ok_or_else(|| ConnError::UnknownAlias {
            family: family.to_string(),
            alias: alias.to_string(),
        })
    }

    /// Alias selection when the reference names only the family: first the
    /// alias marked `default: true`, then the alias literally named
    /// `default`.
    pub fn default_alias<'c>(&'c self, family: &str) -> Result<&'c str, ConnError> {
        let aliases = self
            .families
            .get(family)
            .ok_or_else(|| ConnError::UnknownFamily(family.to_string()))?;
        if let Some((alias, _)) = aliases
            .iter()
            .find(|(_, d)| d.get("default") == Some(&serde_json::Value::Bool(true)))
        {
            return Ok(alias);
        }
        if aliases.contains_key("default") {
            return Ok("default");
        }
        Err(ConnError::NoDefault(family.to_string()))
    }

    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.families.keys().map(String::as_str)
    }
}
