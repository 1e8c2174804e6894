//! SourceRegistry - source の登録と capability による検索

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::RegistryError;
use crate::ports::Source;

/// SourceRegistry は source の登録簿（name -> source）
///
/// 初期化中だけ可変で、その後は読み取り専用。検索にロックは要らない。
#[derive(Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<dyn Source>>,
    by_name: HashMap<String, usize>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn Source>) -> Result<(), RegistryError> {
        let name = source.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(RegistryError::DuplicateSource(name));
        }
        self.by_name.insert(name, self.sources.len());
        self.sources.push(source);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Source>> {
        self.by_name.get(name).map(|&i| &self.sources[i])
    }

    /// `requested` を満たす capability を宣言した source
    ///
    /// # 順序
    /// 1. 完全一致
    /// 2. `domain.*`
    /// 3. `*`
    ///
    /// 同じグループ内は登録順。
    pub fn resolve(&self, requested: &str) -> Vec<Arc<dyn Source>> {
        let mut matches: Vec<(u8, usize, &Arc<dyn Source>)> = self
            .sources
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.best_match(requested).map(|c| (c.specificity(), i, s)))
            .collect();
        matches.sort_by_key(|(rank, i, _)| (*rank, *i));
        matches.into_iter().map(|(_, _, s)| Arc::clone(s)).collect()
    }

    pub fn covers(&self, requested: &str) -> bool {
        self.sources.iter().any(|s| s.best_match(requested).is_some())
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Capability, SourceError};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Named {
        name: &'static str,
        caps: Vec<Capability>,
    }

    impl Named {
        fn new(name: &'static str, caps: &[&str]) -> Arc<dyn Source> {
            Arc::new(Self {
                name,
                caps: caps.iter().map(|c| Capability::parse(c)).collect(),
            })
        }
    }

    #[async_trait]
    impl Source for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> &[Capability] {
            &self.caps
        }

        async fn query(&self, _op: &str, _params: &Value) -> Result<Value, SourceError> {
            Ok(Value::Null)
        }

        async fn is_healthy(&self) -> bool {
            true
        }
    }

    #[test]
    fn resolve_orders_exact_then_domain_then_any() {
        let mut reg = SourceRegistry::new();
        reg.register(Named::new("fallback", &["*"])).unwrap();
        reg.register(Named::new("graph", &["graph.*"])).unwrap();
        reg.register(Named::new("neo4j", &["graph.query", "graph.*"])).unwrap();

        let names: Vec<String> = reg
            .resolve("graph.query")
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["neo4j", "graph", "fallback"]);

        let names: Vec<String> = reg.resolve("diagnostic").iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["fallback"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut reg = SourceRegistry::new();
        reg.register(Named::new("pg", &["sql"])).unwrap();
        let err = reg.register(Named::new("pg", &["sql"])).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateSource("pg".into()));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn covers_reports_capability_gaps() {
        let mut reg = SourceRegistry::new();
        reg.register(Named::new("pg", &["sql.*"])).unwrap();
        assert!(reg.covers("sql.read"));
        assert!(!reg.covers("graph.query"));
        assert!(reg.get("pg").is_some());
    }
}
