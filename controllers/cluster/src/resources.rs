//! Desired host objects for a cluster.
//!
//! Builders return objects labeled with the cluster name but without owner
//! references; [`crate::reconciler`] adds those before writing.

use std::collections::BTreeMap;

use crds::names::{self, AGENT_ROLE, SERVER_ROLE, SERVER_VOLUME_NAME};
use crds::{Cluster, ClusterMode, PersistenceMode};
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, KeyToPath,
    ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, Secret,
    PodSpec, PodTemplateSpec, Probe, SecretKeySelector,
    SecretVolumeSource, SecurityContext, Service, ServiceAccount, ServicePort, ServiceSpec,
    TCPSocketAction, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use pki::bootstrap::{
    CLIENT_CA_CERT_KEY, CLIENT_CA_KEY_KEY, SERVER_CA_CERT_KEY, SERVER_CA_KEY_KEY, TOKEN_KEY,
};
use pki::BootstrapData;

use crate::exposure::{ETCD_PORT, ETCD_PORT_NAME, SERVER_PORT, SERVER_PORT_NAME, SERVER_TARGET_PORT};

pub const KUBELET_PORT: i32 = 10250;
pub const WEBHOOK_PORT: i32 = 9443;

const DATA_DIR: &str = "/var/lib/rancher/k3s";
const TLS_DIR: &str = "/var/lib/rancher/k3s/server/tls";
const TOKEN_DIR: &str = "/opt/k3k/token";
const TOKEN_VOLUME: &str = "token";
const TLS_VOLUME: &str = "tls";

/// Inputs shared by every builder
#[derive(Debug, Clone)]
pub struct BuildContext<'a> {
    pub cluster: &'a Cluster,
    pub name: String,
    pub namespace: String,
    /// Resolved host version, e.g. `v1.30.2-k3s1`
    pub host_version: String,
    pub k3s_image: &'a str,
    pub kubelet_image: &'a str,
}

impl BuildContext<'_> {
    /// k3s image tag: the pinned version, or the host version made tag-safe
    #[must_use]
    pub fn image_tag(&self) -> String {
        let version = &self.cluster.spec.version;
        if version.is_empty() {
            self.host_version.replace('+', "-")
        } else {
            version.replace('+', "-")
        }
    }

    fn k3s_image(&self) -> String {
        format!("{}:{}", self.k3s_image, self.image_tag())
    }

    fn meta(&self, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        }
    }

    fn node_selector(&self) -> Option<BTreeMap<String, String>> {
        let selector = &self.cluster.spec.node_selector;
        (!selector.is_empty()).then(|| selector.clone())
    }

    /// In-namespace DNS name of the server service
    #[must_use]
    pub fn service_fqdn(&self) -> String {
        format!(
            "{}.{}.svc.cluster.local",
            names::service_name(&self.name),
            self.namespace
        )
    }
}

/// Token secret with freshly generated bootstrap material
#[must_use]
pub fn token_secret(ctx: &BuildContext<'_>, bootstrap: &BootstrapData) -> Secret {
    let data = bootstrap
        .to_secret_data()
        .into_iter()
        .map(|(k, v)| (k, ByteString(v)))
        .collect();
    Secret {
        metadata: ctx.meta(names::token_secret_name(&ctx.name), names::cluster_labels(&ctx.name)),
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Headless service giving server pods stable DNS names
#[must_use]
pub fn headless_service(ctx: &BuildContext<'_>) -> Service {
    Service {
        metadata: ctx.meta(names::headless_service_name(&ctx.name), names::cluster_labels(&ctx.name)),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(names::role_labels(&ctx.name, SERVER_ROLE)),
            ports: Some(vec![
                service_port(SERVER_PORT_NAME, SERVER_TARGET_PORT, SERVER_TARGET_PORT, "TCP"),
                service_port(ETCD_PORT_NAME, ETCD_PORT, ETCD_PORT, "TCP"),
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

fn service_port(name: &str, port: i32, target: i32, protocol: &str) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        protocol: Some(protocol.to_string()),
        port,
        target_port: Some(IntOrString::Int(target)),
        ..Default::default()
    }
}

fn pvc_spec(ctx: &BuildContext<'_>) -> PersistentVolumeClaimSpec {
    PersistentVolumeClaimSpec {
        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
        storage_class_name: ctx.cluster.spec.storage_class_name().map(str::to_string),
        resources: Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(ctx.cluster.spec.storage_request_size().to_string()),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One claim per server ordinal, named so the StatefulSet adopts it.
///
/// Empty in ephemeral mode.
#[must_use]
pub fn server_pvcs(ctx: &BuildContext<'_>) -> Vec<PersistentVolumeClaim> {
    if ctx.cluster.spec.persistence_mode() != PersistenceMode::Dynamic {
        return Vec::new();
    }
    (0..ctx.cluster.spec.servers())
        .map(|ordinal| PersistentVolumeClaim {
            metadata: ctx.meta(
                names::server_pvc_name(&ctx.name, ordinal),
                names::role_labels(&ctx.name, SERVER_ROLE),
            ),
            spec: Some(pvc_spec(ctx)),
            status: None,
        })
        .collect()
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn token_volume(ctx: &BuildContext<'_>) -> Volume {
    Volume {
        name: TOKEN_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(names::token_secret_name(&ctx.name)),
            items: Some(vec![KeyToPath {
                key: TOKEN_KEY.to_string(),
                path: TOKEN_KEY.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn token_mount() -> VolumeMount {
    VolumeMount {
        name: TOKEN_VOLUME.to_string(),
        mount_path: TOKEN_DIR.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

fn token_file() -> String {
    format!("{TOKEN_DIR}/{TOKEN_KEY}")
}

const CA_FILES: [&str; 4] = [
    SERVER_CA_CERT_KEY,
    SERVER_CA_KEY_KEY,
    CLIENT_CA_CERT_KEY,
    CLIENT_CA_KEY_KEY,
];

/// CA files projected one by one so k3s can still write its own certs beside them
fn tls_volume_and_mounts(ctx: &BuildContext<'_>) -> (Volume, Vec<VolumeMount>) {
    let volume = Volume {
        name: TLS_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(names::token_secret_name(&ctx.name)),
            items: Some(
                CA_FILES
                    .iter()
                    .map(|key| KeyToPath {
                        key: (*key).to_string(),
                        path: (*key).to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mounts = CA_FILES
        .iter()
        .map(|key| VolumeMount {
            name: TLS_VOLUME.to_string(),
            mount_path: format!("{TLS_DIR}/{key}"),
            sub_path: Some((*key).to_string()),
            read_only: Some(true),
            ..Default::default()
        })
        .collect();
    (volume, mounts)
}

/// `k3s server` flags, without the join flags of HA replicas
#[must_use]
pub fn server_args(ctx: &BuildContext<'_>) -> Vec<String> {
    let spec = &ctx.cluster.spec;
    let mut args = vec![
        format!("--token-file={}", token_file()),
        format!("--tls-san={}", ctx.service_fqdn()),
        format!("--tls-san={}", names::service_name(&ctx.name)),
    ];
    args.extend(spec.tls_sans.iter().map(|san| format!("--tls-san={san}")));
    if let Some(cidr) = &spec.cluster_cidr {
        args.push(format!("--cluster-cidr={cidr}"));
    }
    if let Some(cidr) = &spec.service_cidr {
        args.push(format!("--service-cidr={cidr}"));
    }
    if spec.mode() == ClusterMode::Shared {
        args.push("--disable-agent".to_string());
    }
    args.extend(spec.server_args.iter().cloned());
    args
}

/// Container command and args of a server pod.
///
/// With more than one server the first replica initializes embedded etcd and
/// the others join it through the headless service.
fn server_command(ctx: &BuildContext<'_>) -> (Option<Vec<String>>, Vec<String>) {
    let args = server_args(ctx);
    if ctx.cluster.spec.servers() <= 1 {
        let mut full = vec!["server".to_string()];
        full.extend(args);
        return (None, full);
    }

    let first = format!(
        "{}-0.{}",
        names::server_statefulset_name(&ctx.name),
        names::headless_service_name(&ctx.name)
    );
    let quoted = args
        .iter()
        .map(|a| format!("'{}'", a.replace('\'', r"'\''")))
        .collect::<Vec<_>>()
        .join(" ");
    let script = format!(
        "if [ \"${{POD_NAME##*-}}\" = \"0\" ]; then exec k3s server --cluster-init {quoted}; \
         else exec k3s server --server=https://{first}:{SERVER_TARGET_PORT} {quoted}; fi"
    );
    (
        Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        vec![script],
    )
}

fn privileged() -> Option<SecurityContext> {
    Some(SecurityContext {
        privileged: Some(true),
        ..Default::default()
    })
}

/// Server StatefulSet `k3k-<cluster>-server`
#[must_use]
pub fn server_statefulset(ctx: &BuildContext<'_>) -> StatefulSet {
    let labels = names::role_labels(&ctx.name, SERVER_ROLE);
    let dynamic = ctx.cluster.spec.persistence_mode() == PersistenceMode::Dynamic;
    let (tls_volume, tls_mounts) = tls_volume_and_mounts(ctx);
    let (command, args) = server_command(ctx);

    let mut volumes = vec![token_volume(ctx), tls_volume];
    if !dynamic {
        volumes.push(Volume {
            name: SERVER_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
    }

    let mut mounts = vec![
        VolumeMount {
            name: SERVER_VOLUME_NAME.to_string(),
            mount_path: DATA_DIR.to_string(),
            ..Default::default()
        },
        token_mount(),
    ];
    mounts.extend(tls_mounts);

    let claim_templates = dynamic.then(|| {
        vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(SERVER_VOLUME_NAME.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(pvc_spec(ctx)),
            status: None,
        }]
    });

    StatefulSet {
        metadata: ctx.meta(names::server_statefulset_name(&ctx.name), names::cluster_labels(&ctx.name)),
        spec: Some(StatefulSetSpec {
            replicas: Some(ctx.cluster.spec.servers()),
            service_name: Some(names::headless_service_name(&ctx.name)),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_selector: ctx.node_selector(),
                    priority_class_name: ctx.cluster.spec.priority_class.clone(),
                    containers: vec![Container {
                        name: "k3s-server".to_string(),
                        image: Some(ctx.k3s_image()),
                        command,
                        args: Some(args),
                        env: Some(vec![
                            field_env("POD_NAME", "metadata.name"),
                            field_env("POD_IP", "status.podIP"),
                        ]),
                        ports: Some(vec![
                            ContainerPort {
                                name: Some(SERVER_PORT_NAME.to_string()),
                                container_port: SERVER_TARGET_PORT,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            },
                            ContainerPort {
                                name: Some(ETCD_PORT_NAME.to_string()),
                                container_port: ETCD_PORT,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            },
                        ]),
                        readiness_probe: Some(Probe {
                            tcp_socket: Some(TCPSocketAction {
                                port: IntOrString::Int(SERVER_TARGET_PORT),
                                ..Default::default()
                            }),
                            period_seconds: Some(10),
                            ..Default::default()
                        }),
                        security_context: privileged(),
                        volume_mounts: Some(mounts),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            volume_claim_templates: claim_templates,
            ..Default::default()
        }),
        status: None,
    }
}

/// Agent Deployment for virtual mode; `None` when no agents are requested
#[must_use]
pub fn agent_deployment(ctx: &BuildContext<'_>) -> Option<Deployment> {
    let spec = &ctx.cluster.spec;
    if spec.mode() != ClusterMode::Virtual || spec.agents() == 0 {
        return None;
    }
    let labels = names::role_labels(&ctx.name, AGENT_ROLE);

    let mut args = vec![
        "agent".to_string(),
        format!("--server=https://{}:{SERVER_PORT}", names::service_name(&ctx.name)),
        format!("--token-file={}", token_file()),
    ];
    args.extend(spec.agent_args.iter().cloned());

    Some(Deployment {
        metadata: ctx.meta(names::agent_deployment_name(&ctx.name), names::cluster_labels(&ctx.name)),
        spec: Some(DeploymentSpec {
            replicas: Some(spec.agents()),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_selector: ctx.node_selector(),
                    priority_class_name: spec.priority_class.clone(),
                    containers: vec![Container {
                        name: "k3s-agent".to_string(),
                        image: Some(ctx.k3s_image()),
                        args: Some(args),
                        security_context: privileged(),
                        volume_mounts: Some(vec![token_mount()]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![token_volume(ctx)]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Service account the kubelet bridge runs as
#[must_use]
pub fn kubelet_service_account(ctx: &BuildContext<'_>) -> ServiceAccount {
    ServiceAccount {
        metadata: ctx.meta(names::kubelet_name(&ctx.name), names::cluster_labels(&ctx.name)),
        ..Default::default()
    }
}

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |items: &[&str]| Some(items.iter().map(|s| (*s).to_string()).collect());
    PolicyRule {
        api_groups: owned(groups),
        resources: owned(resources),
        verbs: verbs.iter().map(|s| (*s).to_string()).collect(),
        ..Default::default()
    }
}

/// Namespaced permissions of the kubelet bridge
#[must_use]
pub fn kubelet_role(ctx: &BuildContext<'_>) -> Role {
    const ALL: &[&str] = &["get", "list", "watch", "create", "update", "patch", "delete"];
    Role {
        metadata: ctx.meta(names::kubelet_name(&ctx.name), names::cluster_labels(&ctx.name)),
        rules: Some(vec![
            rule(
                &[""],
                &["pods", "pods/status", "services", "persistentvolumeclaims", "secrets"],
                ALL,
            ),
            rule(&[""], &["pods/log", "pods/exec", "pods/attach"], &["get", "create"]),
            rule(&["k3k.io"], &["clusters"], &["get", "list", "watch"]),
            rule(&["coordination.k8s.io"], &["leases"], ALL),
        ]),
    }
}

#[must_use]
pub fn kubelet_role_binding(ctx: &BuildContext<'_>) -> RoleBinding {
    let name = names::kubelet_name(&ctx.name);
    RoleBinding {
        metadata: ctx.meta(name.clone(), names::cluster_labels(&ctx.name)),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: Some(ctx.namespace.clone()),
            ..Default::default()
        }]),
    }
}

/// Kubelet bridge Deployment for shared mode
#[must_use]
pub fn kubelet_deployment(ctx: &BuildContext<'_>) -> Deployment {
    let name = names::kubelet_name(&ctx.name);
    let labels = names::role_labels(&ctx.name, AGENT_ROLE);

    let env = vec![
        value_env("CLUSTER_NAME", ctx.name.clone()),
        value_env("CLUSTER_NAMESPACE", ctx.namespace.clone()),
        value_env("AGENT_HOSTNAME", name.clone()),
        value_env("SERVICE_NAME", name.clone()),
        value_env("KUBELET_PORT", KUBELET_PORT.to_string()),
        value_env("WEBHOOK_PORT", WEBHOOK_PORT.to_string()),
        value_env("VERSION", ctx.image_tag()),
        field_env("POD_IP", "status.podIP"),
        EnvVar {
            name: "TOKEN".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: names::token_secret_name(&ctx.name),
                    key: TOKEN_KEY.to_string(),
                    optional: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    Deployment {
        metadata: ctx.meta(name.clone(), names::cluster_labels(&ctx.name)),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(name),
                    node_selector: ctx.node_selector(),
                    containers: vec![Container {
                        name: "k3k-kubelet".to_string(),
                        image: Some(ctx.kubelet_image.to_string()),
                        env: Some(env),
                        ports: Some(vec![
                            ContainerPort {
                                name: Some("kubelet".to_string()),
                                container_port: KUBELET_PORT,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            },
                            ContainerPort {
                                name: Some("webhook".to_string()),
                                container_port: WEBHOOK_PORT,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Service in front of the kubelet bridge
#[must_use]
pub fn kubelet_service(ctx: &BuildContext<'_>) -> Service {
    Service {
        metadata: ctx.meta(names::kubelet_name(&ctx.name), names::cluster_labels(&ctx.name)),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(names::role_labels(&ctx.name, AGENT_ROLE)),
            ports: Some(vec![
                service_port("kubelet", KUBELET_PORT, KUBELET_PORT, "TCP"),
                service_port("webhook", WEBHOOK_PORT, WEBHOOK_PORT, "TCP"),
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Host service selecting the shadows of the virtual cluster DNS pods
#[must_use]
pub fn dns_service(ctx: &BuildContext<'_>) -> Service {
    let mut selector = names::cluster_labels(&ctx.name);
    selector.insert("k8s-app".to_string(), "kube-dns".to_string());
    Service {
        metadata: ctx.meta(names::dns_service_name(&ctx.name), names::cluster_labels(&ctx.name)),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector),
            ports: Some(vec![
                service_port("dns", 53, 53, "UDP"),
                service_port("dns-tcp", 53, 53, "TCP"),
                service_port("metrics", 9153, 9153, "TCP"),
            ]),
            ..Default::default()
        }),
        status: None,
    }
}
