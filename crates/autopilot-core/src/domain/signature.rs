//! Signature - 決定的シグネチャ
//!
//! 呼び出しをまたいで「同じタスク」（または「同じクエリ」）を識別する。
//!
//! # フロー
//! 1. トップレベルの揮発キーを除去
//! 2. 全階層でキーをソートしてシリアライズ
//! 3. SHA-256 でハッシュ

use serde_json::Value;
use sha2::{Digest, Sha256};

/// 論理的に同じタスク間で変わるキー
pub const TASK_VOLATILE_KEYS: &[&str] = &["timestamp", "id", "createdAt", "updatedAt", "userId", "orgId"];

/// 論理的に同じクエリ間で変わるキー
pub const QUERY_VOLATILE_KEYS: &[&str] = &["timestamp", "requestId", "id"];

const PREFIX: &str = "sig-";
const HEX_LEN: usize = 16;

/// task recorder が使う `(task_type, params)` のシグネチャ
pub fn task_signature(task_type: &str, params: &Value) -> String {
    signature(task_type, params, TASK_VOLATILE_KEYS)
}

/// pattern memory が使う `(query_type, params)` のシグネチャ
pub fn query_signature(query_type: &str, params: &Value) -> String {
    signature(query_type, params, QUERY_VOLATILE_KEYS)
}

fn signature(kind: &str, params: &Value, volatile: &[&str]) -> String {
    let stripped = strip_volatile(params, volatile);

    let mut buf = String::with_capacity(64);
    buf.push_str(kind);
    buf.push('\n');
    write_canonical(&stripped, &mut buf);

    let digest = Sha256::digest(buf.as_bytes());
    let mut out = String::with_capacity(PREFIX.len() + HEX_LEN);
    out.push_str(PREFIX);
    out.push_str(&hex::encode(digest)[..HEX_LEN]);
    out
}

/// オブジェクトのトップレベルから揮発キーを除く（それ以外はそのまま）
pub fn strip_volatile(params: &Value, volatile: &[&str]) -> Value {
    match params {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !volatile.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// 全階層でキーをソートした JSON 文字列（serde_json の Map 実装に依存しない）
pub fn canonical_json(value: &Value) -> String {
    let mut buf = String::new();
    write_canonical(value, &mut buf);
    buf
}

fn write_canonical(value: &Value, buf: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            buf.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                // String キーは必ずシリアライズできる
                buf.push_str(&Value::String(key.clone()).to_string());
                buf.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, buf);
                }
            }
            buf.push('}');
        }
        Value::Array(items) => {
            buf.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_canonical(item, buf);
            }
            buf.push(']');
        }
        scalar => buf.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_has_prefix_and_fixed_length() {
        let sig = task_signature("sync", &json!({"a": 1}));
        assert!(sig.starts_with("sig-"));
        assert_eq!(sig.len(), 4 + 16);
    }

    #[test]
    fn signature_ignores_key_order() {
        let a = json!({"a": 1, "b": {"x": true, "y": [1, 2]}});
        let b = json!({"b": {"y": [1, 2], "x": true}, "a": 1});
        assert_eq!(task_signature("sync", &a), task_signature("sync", &b));
    }

    #[test]
    fn signature_ignores_volatile_fields() {
        let a = json!({"report": "weekly", "userId": "u1", "orgId": "o1", "timestamp": 1, "id": "a"});
        let b = json!({"report": "weekly", "userId": "u2", "createdAt": "2024-01-01", "updatedAt": "x"});
        assert_eq!(task_signature("export", &a), task_signature("export", &b));
    }

    #[test]
    fn signature_depends_on_type_and_stable_params() {
        let p = json!({"report": "weekly"});
        assert_ne!(task_signature("export", &p), task_signature("import", &p));
        assert_ne!(
            task_signature("export", &p),
            task_signature("export", &json!({"report": "daily"}))
        );
    }

    #[test]
    fn nested_volatile_keys_are_kept() {
        let a = json!({"filter": {"id": 1}});
        let b = json!({"filter": {"id": 2}});
        assert_ne!(task_signature("q", &a), task_signature("q", &b));
    }

    #[test]
    fn query_signature_strips_request_id() {
        let a = json!({"q": "cpu", "requestId": "r1"});
        let b = json!({"q": "cpu", "requestId": "r2"});
        assert_eq!(query_signature("metrics", &a), query_signature("metrics", &b));
        // クエリでは userId は揮発キーではない
        assert_ne!(
            query_signature("metrics", &json!({"userId": 1})),
            query_signature("metrics", &json!({"userId": 2}))
        );
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        assert_eq!(
            canonical_json(&json!({"b": 1, "a": {"d": null, "c": "x"}})),
            r#"{"a":{"c":"x","d":null},"b":1}"#
        );
    }
}
