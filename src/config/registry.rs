//! ワークフロー定義のレジストリ
//!
//! 名前とバージョンで定義を引けるようにします。
//! バージョン省略時は最新のバージョンを返します。
//!
//! バージョンは semver として比較します。`"2"` や `"1.4"` のように省略された
//! 形式は不足分を `0` で補い、semver として解釈できないものは常に古い扱いです。

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use semver::Version;

use super::workflow::WorkflowDefinition;
use crate::error::ConfigError;

/// ワークフロー定義のレジストリ
#[derive(Debug, Default, Clone)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, Vec<Arc<WorkflowDefinition>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 定義を登録
    ///
    /// 同じ名前・バージョンの定義が既にある場合は置き換えます。
    pub fn register(&mut self, definition: WorkflowDefinition) -> Arc<WorkflowDefinition> {
        let definition = Arc::new(definition);
        let versions = self
            .definitions
            .entry(definition.name().to_string())
            .or_default();
        versions.retain(|existing| existing.version() != definition.version());
        versions.push(Arc::clone(&definition));
        definition
    }

    /// ディレクトリ内の `*.toml` をすべて読み込んで登録
    ///
    /// 登録した定義の数を返します。
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize, ConfigError> {
        let mut paths = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect::<Vec<_>>();
        paths.sort();

        for path in &paths {
            let definition = WorkflowDefinition::from_file(path)?;
            tracing::debug!(
                path = %path.display(),
                workflow = %definition.reference(),
                "loaded workflow definition"
            );
            self.register(definition);
        }
        Ok(paths.len())
    }

    /// 名前（と任意のバージョン）で定義を引く
    pub fn get(&self, name: &str, version: Option<&str>) -> Option<Arc<WorkflowDefinition>> {
        let versions = self.definitions.get(name)?;
        match version {
            Some(version) => versions.iter().find(|d| d.version() == version).cloned(),
            None => versions
                .iter()
                .max_by(|a, b| compare_versions(a.version(), b.version()))
                .cloned(),
        }
    }

    pub fn len(&self) -> usize {
        self.definitions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// `"2"` → `2.0.0`、`"1.4"` → `1.4.0` として解釈
fn parse_version(raw: &str) -> Option<Version> {
    Version::parse(raw).ok().or_else(|| {
        let padded = match raw.matches('.').count() {
            0 => format!("{raw}.0.0"),
            1 => format!("{raw}.0"),
            _ => return None,
        };
        Version::parse(&padded).ok()
    })
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(version: &str) -> WorkflowDefinition {
        WorkflowDefinition::from_toml(&format!(
            r#"
            [workflow]
            name = "triage"
            version = "{version}"

            [[steps]]
            id = "classify"
            agents = ["classifier"]
            next = {{ ok = "end" }}
            "#
        ))
        .unwrap()
    }

    #[test]
    fn test_get_latest_and_specific_version() {
        let mut registry = DefinitionRegistry::new();
        registry.register(definition("1"));
        registry.register(definition("2"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("triage", None).unwrap().version(), "2");
        assert_eq!(registry.get("triage", Some("1")).unwrap().version(), "1");
        assert!(registry.get("triage", Some("3")).is_none());
        assert!(registry.get("unknown", None).is_none());
    }

    #[test]
    fn test_latest_compares_versions_not_registration_order() {
        let mut registry = DefinitionRegistry::new();
        registry.register(definition("10"));
        registry.register(definition("2"));
        assert_eq!(registry.get("triage", None).unwrap().version(), "10");

        registry.register(definition("10.1.0"));
        registry.register(definition("10.0.5"));
        registry.register(definition("nightly"));
        assert_eq!(registry.get("triage", None).unwrap().version(), "10.1.0");
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("2", "2.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.0-rc.1", "1.0.0"), Ordering::Less);
        assert_eq!(compare_versions("draft", "1"), Ordering::Less);
    }

    #[test]
    fn test_reregister_replaces_same_version() {
        let mut registry = DefinitionRegistry::new();
        registry.register(definition("1"));
        registry.register(definition("1"));

        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        definition("1").to_file(dir.path().join("triage.toml")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = DefinitionRegistry::new();
        let loaded = registry.load_dir(dir.path()).unwrap();

        assert_eq!(loaded, 1);
        assert!(registry.get("triage", Some("1")).is_some());
    }

    #[test]
    fn test_load_dir_picks_latest_regardless_of_file_order() {
        let dir = tempfile::tempdir().unwrap();
        definition("10").to_file(dir.path().join("v10.toml")).unwrap();
        definition("2").to_file(dir.path().join("v2.toml")).unwrap();

        let mut registry = DefinitionRegistry::new();
        assert_eq!(registry.load_dir(dir.path()).unwrap(), 2);
        assert_eq!(registry.get("triage", None).unwrap().version(), "10");
    }
}
