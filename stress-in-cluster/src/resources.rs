//! Kubernetes objects created by the runner.
//!
//! The runner installs a service account with cluster-wide access to the
//! resources the stress driver touches, a ConfigMap holding a fallback
//! kubeconfig, and a CronJob whose pods run `k8s-tester-stress apply`.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, HostPathVolumeSource, PodSpec, PodTemplateSpec,
    SecurityContext, ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::InClusterConfig;
use crate::error::Result;

pub const SERVICE_ACCOUNT_NAME: &str = "stress-in-cluster-service-account";
pub const CLUSTER_ROLE_NAME: &str = "stress-in-cluster-rbac-role";
pub const CLUSTER_ROLE_BINDING_NAME: &str = "stress-in-cluster-rbac-role-binding";
pub const KUBECONFIG_CONFIG_MAP_NAME: &str = "stress-in-cluster-kubeconfig-configmap";
pub const KUBECONFIG_FILE_NAME: &str = "stress-in-cluster-kubeconfig-configmap.yaml";
pub const APP_NAME: &str = "stress-in-cluster-app";
pub const CRON_JOB_NAME: &str = "stress-in-cluster-cronjob";

/// Label carrying the CronJob name on the job template and its pods.
pub const CRON_JOB_LABEL: &str = "cronjob-name";

const APP_LABEL: &str = "app.kubernetes.io/name";
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Location of the driver binary in the stress image.
const STRESS_BINARY_PATH: &str = "/k8s-tester-stress";

/// Directory the kubeconfig ConfigMap is mounted at.
const CONFIG_MOUNT_PATH: &str = "/opt";
const VAR_LOG_VOLUME: &str = "varlog";
const VAR_LOG_PATH: &str = "/var/log";

const ROLE_RESOURCES: &[&str] = &[
    "configmaps",
    "leases",
    "nodes",
    "pods",
    "secrets",
    "services",
    "namespaces",
    "endpoints",
    "events",
    "ingresses",
    "ingresses/status",
    "jobs",
    "cronjobs",
];
const ROLE_VERBS: &[&str] = &["create", "get", "list", "update", "watch", "patch"];

/// Kinds of objects the runner creates, in creation order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResourceKind {
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    ConfigMap,
    CronJob,
}

impl ResourceKind {
    /// Reverse creation order, used for teardown.
    pub const TEARDOWN: [ResourceKind; 5] = [
        ResourceKind::CronJob,
        ResourceKind::ConfigMap,
        ResourceKind::ClusterRoleBinding,
        ResourceKind::ClusterRole,
        ResourceKind::ServiceAccount,
    ];

    /// Name of the runner's object of this kind.
    pub fn object_name(self) -> &'static str {
        match self {
            ResourceKind::ServiceAccount => SERVICE_ACCOUNT_NAME,
            ResourceKind::ClusterRole => CLUSTER_ROLE_NAME,
            ResourceKind::ClusterRoleBinding => CLUSTER_ROLE_BINDING_NAME,
            ResourceKind::ConfigMap => KUBECONFIG_CONFIG_MAP_NAME,
            ResourceKind::CronJob => CRON_JOB_NAME,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An object to create.
#[derive(Clone, Debug, PartialEq)]
pub enum Resource {
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    ConfigMap(ConfigMap),
    CronJob(CronJob),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::ServiceAccount(_) => ResourceKind::ServiceAccount,
            Resource::ClusterRole(_) => ResourceKind::ClusterRole,
            Resource::ClusterRoleBinding(_) => ResourceKind::ClusterRoleBinding,
            Resource::ConfigMap(_) => ResourceKind::ConfigMap,
            Resource::CronJob(_) => ResourceKind::CronJob,
        }
    }

    pub fn name(&self) -> &str {
        let metadata = match self {
            Resource::ServiceAccount(object) => &object.metadata,
            Resource::ClusterRole(object) => &object.metadata,
            Resource::ClusterRoleBinding(object) => &object.metadata,
            Resource::ConfigMap(object) => &object.metadata,
            Resource::CronJob(object) => &object.metadata,
        };
        metadata.name.as_deref().unwrap_or_default()
    }
}

/// All objects of a runner installation, in creation order.
pub fn resources(config: &InClusterConfig, kubeconfig: &str) -> Vec<Resource> {
    let namespace = config.namespace.as_str();
    vec![
        Resource::ServiceAccount(service_account(namespace)),
        Resource::ClusterRole(cluster_role()),
        Resource::ClusterRoleBinding(cluster_role_binding(namespace)),
        Resource::ConfigMap(kubeconfig_config_map(namespace, kubeconfig)),
        Resource::CronJob(cron_job(config)),
    ]
}

fn labels(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
    Some(
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect(),
    )
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_owned()).collect()
}

pub fn service_account(namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(SERVICE_ACCOUNT_NAME.into()),
            namespace: Some(namespace.into()),
            labels: labels(&[(APP_LABEL, APP_NAME)]),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Role granting the stress driver access to its resources in all API groups.
pub fn cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_NAME.into()),
            labels: labels(&[(APP_LABEL, APP_NAME)]),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(strings(&["*"])),
            resources: Some(strings(ROLE_RESOURCES)),
            verbs: strings(ROLE_VERBS),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Binds the role to the service account and to the nodes' user.
pub fn cluster_role_binding(namespace: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_BINDING_NAME.into()),
            labels: labels(&[(APP_LABEL, APP_NAME)]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.into(),
            kind: "ClusterRole".into(),
            name: CLUSTER_ROLE_NAME.into(),
        },
        subjects: Some(vec![
            Subject {
                api_group: Some(String::new()),
                kind: "ServiceAccount".into(),
                name: SERVICE_ACCOUNT_NAME.into(),
                namespace: Some(namespace.into()),
            },
            Subject {
                api_group: Some(RBAC_API_GROUP.into()),
                kind: "User".into(),
                name: "system:node".into(),
                namespace: None,
            },
        ]),
    }
}

pub fn kubeconfig_config_map(namespace: &str, kubeconfig: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(KUBECONFIG_CONFIG_MAP_NAME.into()),
            namespace: Some(namespace.into()),
            labels: labels(&[("name", KUBECONFIG_CONFIG_MAP_NAME)]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            KUBECONFIG_FILE_NAME.to_owned(),
            kubeconfig.to_owned(),
        )])),
        ..Default::default()
    }
}

/// Command line run by every CronJob pod.
///
/// Every value is a separate argument, so the container runs the driver
/// without a shell in between. The mounted kubeconfig is passed as fallback
/// only. The driver prefers the pod's service account credentials.
pub fn stress_command(config: &InClusterConfig) -> Vec<String> {
    let stress = &config.stress;
    let mut command = strings(&[
        STRESS_BINARY_PATH,
        "--prompt",
        "false",
        "--namespace",
        config.namespace.as_str(),
        "--kubectl-path",
        "/kubectl",
        "--kubeconfig-path",
        format!("{CONFIG_MOUNT_PATH}/{KUBECONFIG_FILE_NAME}").as_str(),
        "apply",
    ]);
    if let Some(image) = &stress.busybox_image {
        command.extend(strings(&["--ecr-busybox-image", image.as_str()]));
    }
    command.extend(strings(&[
        "--run-timeout",
        compact_duration(stress.run_timeout).as_str(),
        "--object-key-prefix",
        stress.object_key_prefix.as_str(),
        "--objects",
        stress.objects.to_string().as_str(),
        "--object-size",
        stress.object_size.as_u64().to_string().as_str(),
        "--update-concurrency",
        stress.update_concurrency.to_string().as_str(),
        "--list-batch-limit",
        stress.list_batch_limit.to_string().as_str(),
    ]));
    command
}

/// Formats a duration like `1m30s`, without the separating spaces of
/// [`humantime::format_duration`].
fn compact_duration(duration: std::time::Duration) -> String {
    humantime::format_duration(duration)
        .to_string()
        .replace(' ', "")
}

pub fn cron_job(config: &InClusterConfig) -> CronJob {
    let namespace = config.namespace.as_str();
    let container = Container {
        name: CRON_JOB_NAME.into(),
        image: Some(config.stress_image.clone()),
        image_pull_policy: Some("Always".into()),
        command: Some(stress_command(config)),
        // Access to /dev/kmsg.
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: KUBECONFIG_CONFIG_MAP_NAME.into(),
                mount_path: CONFIG_MOUNT_PATH.into(),
                ..Default::default()
            },
            VolumeMount {
                name: VAR_LOG_VOLUME.into(),
                mount_path: VAR_LOG_PATH.into(),
                read_only: Some(false),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let pod_template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: labels(&[(CRON_JOB_LABEL, CRON_JOB_NAME)]),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            service_account_name: Some(SERVICE_ACCOUNT_NAME.into()),
            restart_policy: Some("Never".into()),
            containers: vec![container],
            volumes: Some(vec![
                Volume {
                    name: KUBECONFIG_CONFIG_MAP_NAME.into(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: Some(KUBECONFIG_CONFIG_MAP_NAME.into()),
                        default_mode: Some(0o777),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: VAR_LOG_VOLUME.into(),
                    host_path: Some(HostPathVolumeSource {
                        path: VAR_LOG_PATH.into(),
                        type_: Some("DirectoryOrCreate".into()),
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
    };

    CronJob {
        metadata: ObjectMeta {
            name: Some(CRON_JOB_NAME.into()),
            namespace: Some(namespace.into()),
            labels: labels(&[(CRON_JOB_LABEL, CRON_JOB_NAME)]),
            ..Default::default()
        },
        spec: Some(CronJobSpec {
            schedule: config.schedule.clone(),
            concurrency_policy: Some("Replace".into()),
            successful_jobs_history_limit: Some(config.successful_jobs_history_limit),
            failed_jobs_history_limit: Some(config.failed_jobs_history_limit),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(CRON_JOB_NAME.into()),
                    namespace: Some(namespace.into()),
                    labels: labels(&[(CRON_JOB_LABEL, CRON_JOB_NAME)]),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    completions: Some(config.completes),
                    parallelism: Some(config.parallels),
                    template: pod_template,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Renders an object as YAML for the log.
pub fn to_yaml<T: serde::Serialize>(object: &T) -> Result<String> {
    Ok(serde_yaml::to_string(object)?)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytesize::ByteSize;

    use super::*;
    use crate::config::StressArgs;

    fn config() -> InClusterConfig {
        InClusterConfig {
            namespace: "stress-ns".into(),
            stress_image: "registry.local/k8s-tester-stress:v1".into(),
            completes: 4,
            parallels: 2,
            stress: StressArgs {
                busybox_image: Some("registry.local/busybox".into()),
                run_timeout: Duration::from_secs(90),
                object_key_prefix: "podabc".into(),
                objects: -1,
                object_size: ByteSize::kib(10),
                update_concurrency: 10,
                list_batch_limit: 1000,
            },
            ..Default::default()
        }
    }

    #[test]
    fn command_mirrors_driver_flags() {
        similar_asserts::assert_eq!(
            stress_command(&config()).join(" "),
            "/k8s-tester-stress --prompt false --namespace stress-ns --kubectl-path /kubectl \
             --kubeconfig-path /opt/stress-in-cluster-kubeconfig-configmap.yaml apply \
             --ecr-busybox-image registry.local/busybox --run-timeout 1m30s \
             --object-key-prefix podabc --objects -1 --object-size 10240 \
             --update-concurrency 10 --list-batch-limit 1000"
        );
    }

    #[test]
    fn values_stay_single_arguments() {
        let mut config = config();
        config.namespace = "stress ns".into();
        config.stress.object_key_prefix = "pod$(reboot); echo".into();
        config.stress.busybox_image = Some("busybox:latest && id".into());

        let command = stress_command(&config);
        let value_of = |flag: &str| {
            let index = command.iter().position(|arg| arg == flag).unwrap();
            command[index + 1].clone()
        };
        assert_eq!(value_of("--namespace"), "stress ns");
        assert_eq!(value_of("--object-key-prefix"), "pod$(reboot); echo");
        assert_eq!(value_of("--ecr-busybox-image"), "busybox:latest && id");

        let job = cron_job(&config).spec.unwrap().job_template.spec.unwrap();
        let pod = job.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.command.as_ref(), Some(&command));
        assert_eq!(command[0], "/k8s-tester-stress");
        assert!(container.args.is_none());
    }

    #[test]
    fn compact_durations_parse() {
        for duration in [Duration::from_secs(90), Duration::from_secs(3 * 3600 + 1)] {
            let formatted = compact_duration(duration);
            assert!(!formatted.contains(' '));
            assert_eq!(humantime::parse_duration(&formatted).unwrap(), duration);
        }
    }

    #[test]
    fn command_without_busybox_image() {
        let mut config = config();
        config.stress.busybox_image = None;
        let command = stress_command(&config).join(" ");
        assert!(!command.contains("--ecr-busybox-image"));
        assert!(command.contains(" apply --run-timeout "));
    }

    #[test]
    fn cron_job_shape() {
        let cron_job = cron_job(&config());
        let spec = cron_job.spec.unwrap();
        assert_eq!(spec.schedule, "*/10 * * * *");
        assert_eq!(spec.concurrency_policy.as_deref(), Some("Replace"));
        assert_eq!(spec.successful_jobs_history_limit, Some(10));

        let job = spec.job_template.spec.unwrap();
        assert_eq!(job.completions, Some(4));
        assert_eq!(job.parallelism, Some(2));

        let pod = job.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.service_account_name.as_deref(), Some(SERVICE_ACCOUNT_NAME));
        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("registry.local/k8s-tester-stress:v1")
        );
        assert_eq!(
            container.security_context.as_ref().and_then(|c| c.privileged),
            Some(true)
        );

        let volumes = pod.volumes.unwrap();
        let config_map = volumes[0].config_map.as_ref().unwrap();
        assert_eq!(config_map.default_mode, Some(0o777));
        let host_path = volumes[1].host_path.as_ref().unwrap();
        assert_eq!(host_path.path, "/var/log");
        assert_eq!(host_path.type_.as_deref(), Some("DirectoryOrCreate"));
    }

    #[test]
    fn role_binding_subjects() {
        let binding = cluster_role_binding("stress-ns");
        assert_eq!(binding.role_ref.name, CLUSTER_ROLE_NAME);
        let subjects = binding.subjects.unwrap();
        assert_eq!(subjects[0].kind, "ServiceAccount");
        assert_eq!(subjects[0].namespace.as_deref(), Some("stress-ns"));
        assert_eq!(subjects[1].name, "system:node");

        let role = cluster_role();
        let rule = &role.rules.unwrap()[0];
        assert_eq!(rule.verbs.len(), 6);
        assert!(rule.resources.as_ref().unwrap().contains(&"cronjobs".to_owned()));
    }

    #[test]
    fn resources_in_creation_order() {
        let kinds: Vec<_> = resources(&config(), "apiVersion: v1")
            .iter()
            .map(|resource| (resource.kind(), resource.name().to_owned()))
            .collect();
        assert_eq!(kinds.len(), 5);
        for (kind, name) in &kinds {
            assert_eq!(name, kind.object_name());
        }
        let mut teardown: Vec<_> = kinds.iter().map(|(kind, _)| *kind).collect();
        teardown.reverse();
        assert_eq!(teardown, ResourceKind::TEARDOWN);
    }

    #[test]
    fn cron_job_yaml() {
        let yaml = to_yaml(&cron_job(&config())).unwrap();
        assert!(yaml.contains("concurrencyPolicy: Replace"));
        assert!(yaml.contains("name: stress-in-cluster-cronjob"));
    }
}
