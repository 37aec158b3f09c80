//! PersistentVolumeClaim shadows.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
use serde_json::{Value, json};

use super::{Mirror, ShadowKey};

fn shadow_spec(spec: &PersistentVolumeClaimSpec) -> PersistentVolumeClaimSpec {
    PersistentVolumeClaimSpec {
        access_modes: spec.access_modes.clone(),
        resources: spec.resources.clone(),
        // An empty class asks for no class; on the host the default applies
        storage_class_name: spec.storage_class_name.clone().filter(|c| !c.is_empty()),
        volume_mode: spec.volume_mode.clone(),
        ..Default::default()
    }
}

impl Mirror for PersistentVolumeClaim {
    fn to_shadow(&self, key: &ShadowKey, host_namespace: &str) -> Self {
        PersistentVolumeClaim {
            metadata: key.shadow_meta(Some(host_namespace), &self.metadata),
            spec: self.spec.as_ref().map(shadow_spec),
            status: None,
        }
    }

    fn status_patch(shadow: &Self) -> Option<Value> {
        let status = shadow.status.as_ref()?;
        status.phase.as_ref()?;
        Some(json!({
            "status": {
                "phase": status.phase,
                "capacity": status.capacity,
                "accessModes": status.access_modes,
            }
        }))
    }
}
