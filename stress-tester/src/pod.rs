//! Pod objects written by the update loop.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, Pod, PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::distr::{Alphanumeric, SampleString};

/// Number of distinct object keys an update loop cycles through.
pub const KEYSPACE: u64 = 10;

/// Container image used when none is configured.
pub const DEFAULT_IMAGE: &str = "busybox";

const CONFIG_VOLUME: &str = "config";
const CONFIG_MOUNT_PATH: &str = "/config";

/// Returns the object key written in the given iteration.
pub fn object_key(prefix: &str, iteration: u64) -> String {
    format!("{prefix}{}", iteration % KEYSPACE)
}

/// Returns `size` random alphanumeric characters.
pub fn random_value(size: usize) -> String {
    Alphanumeric.sample_string(&mut rand::rng(), size)
}

/// Builds the pod written for an object key.
///
/// The pod appends `value` to a file on an `emptyDir` volume, so the object's
/// size on the API server grows with `value`.
pub fn pod_object(namespace: &str, name: &str, image: &str, value: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(BTreeMap::from([("name".to_owned(), name.to_owned())])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("OnFailure".into()),
            containers: vec![Container {
                name: name.to_owned(),
                image: Some(image.to_owned()),
                image_pull_policy: Some("Always".into()),
                command: Some(vec![
                    "/bin/sh".into(),
                    "-ec".into(),
                    format!("echo -n '{value}' >> {CONFIG_MOUNT_PATH}/output.txt"),
                ]),
                volume_mounts: Some(vec![VolumeMount {
                    name: CONFIG_VOLUME.into(),
                    mount_path: CONFIG_MOUNT_PATH.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: CONFIG_VOLUME.into(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Flips the pod's annotations between absent and `{"key": "value"}`.
pub fn toggle_annotations(pod: &mut Pod) {
    pod.metadata.annotations = match pod.metadata.annotations.take() {
        None => Some(BTreeMap::from([("key".to_owned(), "value".to_owned())])),
        Some(_) => None,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_cycle_through_keyspace() {
        assert_eq!(object_key("podabc", 0), "podabc0");
        assert_eq!(object_key("podabc", 9), "podabc9");
        assert_eq!(object_key("podabc", 10), "podabc0");
        assert_eq!(object_key("podabc", 123), "podabc3");
    }

    #[test]
    fn random_value_size() {
        let value = random_value(10 * 1024);
        assert_eq!(value.len(), 10 * 1024);
        assert!(value.bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn pod_shape() {
        let pod = pod_object("stress", "pod0", "busybox", "xyz");

        assert_eq!(pod.metadata.name.as_deref(), Some("pod0"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("stress"));
        assert_eq!(pod.metadata.labels.unwrap()["name"], "pod0");

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("OnFailure"));
        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("busybox"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(
            container.command.as_deref().unwrap()[2],
            "echo -n 'xyz' >> /config/output.txt"
        );
        assert!(spec.volumes.unwrap()[0].empty_dir.is_some());
    }

    #[test]
    fn annotations_toggle() {
        let mut pod = pod_object("stress", "pod0", "busybox", "xyz");
        assert!(pod.metadata.annotations.is_none());

        toggle_annotations(&mut pod);
        assert_eq!(pod.metadata.annotations.as_ref().unwrap()["key"], "value");

        toggle_annotations(&mut pod);
        assert!(pod.metadata.annotations.is_none());
    }
}
