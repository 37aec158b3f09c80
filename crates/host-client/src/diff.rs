//! Structural comparison of desired and live objects.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// True when every field set in `desired` has the same value in `actual`.
///
/// Fields the server defaulted (present only in `actual`) are ignored. Arrays
/// must have the same length and match element by element.
#[must_use]
pub fn is_subset(desired: &Value, actual: &Value) -> bool {
    match (desired, actual) {
        (Value::Null, _) => true,
        (Value::Object(d), Value::Object(a)) => d.iter().all(|(k, v)| {
            a.get(k)
                .map_or_else(|| v.is_null(), |actual_value| is_subset(v, actual_value))
        }),
        (Value::Array(d), Value::Array(a)) => {
            d.len() == a.len() && d.iter().zip(a).all(|(d, a)| is_subset(d, a))
        }
        (d, a) => d == a,
    }
}

/// Desired object laid over the live one for a replace.
///
/// Server-populated fields such as `resourceVersion`, an allocated `clusterIP`
/// or a bound `volumeName` are kept. Status is dropped.
pub fn overlay<K: Serialize + DeserializeOwned>(desired: &K, actual: &K) -> Result<K, serde_json::Error> {
    let mut live = serde_json::to_value(actual)?;
    json_patch::merge(&mut live, &serde_json::to_value(desired)?);
    if let Some(root) = live.as_object_mut() {
        root.remove("status");
    }
    serde_json::from_value(live)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_and_null_fields() {
        assert!(is_subset(&json!({"a": null}), &json!({})));
        assert!(!is_subset(&json!({"a": 1}), &json!({})));
        assert!(is_subset(&Value::Null, &json!({"anything": true})));
    }

    #[test]
    fn test_nested_arrays_compare_in_order() {
        let desired = json!({"ports": [{"port": 80}, {"port": 443}]});
        assert!(is_subset(&desired, &json!({"ports": [{"port": 80, "protocol": "TCP"}, {"port": 443}]})));
        assert!(!is_subset(&desired, &json!({"ports": [{"port": 443}, {"port": 80}]})));
    }

    #[test]
    fn test_overlay_keeps_allocated_fields() {
        use k8s_openapi::api::core::v1::{Service, ServiceSpec, ServiceStatus};
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

        let live = Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.43.0.20".to_string()),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            status: Some(ServiceStatus::default()),
        };
        let desired = Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let merged = overlay(&desired, &live).unwrap();
        assert_eq!(merged.metadata.resource_version.as_deref(), Some("42"));
        let spec = merged.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.43.0.20"));
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert!(merged.status.is_none());
    }
}
