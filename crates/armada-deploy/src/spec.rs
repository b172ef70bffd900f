//! Apply-spec construction.
//!
//! The apply spec is the configuration handed to an agent and stored as
//! the instance's current state. The binder compares freshly built
//! sections against the stored ones to classify changes, so both sides
//! must come from the same builders here.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use armada_core::{DirectorError, DirectorResult};
use armada_plan::{InstancePlan, JobPlan, Network, ResourcePoolPlan};
use armada_state::{PackageRecord, TemplateRecord};

use crate::compile::CompiledMap;

pub fn job_section(template: &TemplateRecord) -> Value {
    json!({
        "name": template.name,
        "version": template.version,
        "digest": template.digest,
        "blob_id": template.blob_id,
    })
}

pub fn resource_pool_section(pool: &ResourcePoolPlan) -> Value {
    json!({
        "name": pool.name,
        "stemcell": {
            "name": pool.stemcell.name,
            "version": pool.stemcell.version,
        },
        "cloud_properties": pool.cloud_properties,
        "env": pool.env,
    })
}

/// Per-network settings for one instance.
pub fn networks_section(
    job: &JobPlan,
    instance: &InstancePlan,
    networks: &HashMap<String, Network>,
) -> Value {
    let mut section = Map::new();
    for job_network in &job.networks {
        if let Some(network) = networks.get(&job_network.network) {
            let ip = instance.ips.get(&job_network.network).copied();
            section.insert(job_network.network.clone(), network.settings_for(ip));
        }
    }
    Value::Object(section)
}

/// Compiled artifact references for every package the job needs.
pub fn packages_section(
    packages: &[PackageRecord],
    stemcell_key: &str,
    compiled: &CompiledMap,
) -> DirectorResult<Value> {
    let mut section = Map::new();
    for package in packages {
        let record = compiled
            .get(&(package.name.clone(), stemcell_key.to_string()))
            .ok_or_else(|| DirectorError::CompilationFailed {
                package: package.name.clone(),
                detail: "compiled artifact missing after compilation phase".to_string(),
            })?;
        section.insert(
            package.name.clone(),
            json!({
                "name": package.name,
                "version": package.version,
                "fingerprint": package.fingerprint,
                "blob_id": record.blob_id,
                "digest": record.digest,
            }),
        );
    }
    Ok(Value::Object(section))
}

/// Does the stored state carry the same source package identities?
pub fn packages_identity_matches(state: &Value, packages: &[PackageRecord]) -> bool {
    let Some(stored) = state.get("packages").and_then(Value::as_object) else {
        return packages.is_empty();
    };
    if stored.len() != packages.len() {
        return false;
    }
    packages.iter().all(|package| {
        stored.get(&package.name).is_some_and(|entry| {
            entry.get("version").and_then(Value::as_str) == Some(package.version.as_str())
                && entry.get("fingerprint").and_then(Value::as_str)
                    == Some(package.fingerprint.as_str())
        })
    })
}

/// The complete configuration applied to an instance's agent.
pub fn build_apply_spec(
    deployment: &str,
    job: &JobPlan,
    pool: &ResourcePoolPlan,
    instance: &InstancePlan,
    networks: &HashMap<String, Network>,
    compiled: &CompiledMap,
) -> DirectorResult<Value> {
    Ok(json!({
        "deployment": deployment,
        "index": instance.index,
        "job": job_section(&job.template),
        "packages": packages_section(&job.packages, &pool.stemcell.table_key(), compiled)?,
        "networks": networks_section(job, instance, networks),
        "resource_pool": resource_pool_section(pool),
        "persistent_disk": job.persistent_disk_mb.unwrap_or(0),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_state::CompiledPackageRecord;

    fn package(name: &str) -> PackageRecord {
        PackageRecord {
            release: "redis".into(),
            release_version: "3".into(),
            name: name.into(),
            version: "1".into(),
            fingerprint: format!("fp-{name}"),
            blob_id: format!("src-{name}"),
            digest: "d".into(),
            dependencies: vec![],
        }
    }

    fn compiled_map(names: &[&str]) -> CompiledMap {
        names
            .iter()
            .map(|name| {
                (
                    (name.to_string(), "ubuntu/1.2".to_string()),
                    CompiledPackageRecord {
                        package_name: name.to_string(),
                        package_version: "1".into(),
                        fingerprint: format!("fp-{name}"),
                        stemcell_name: "ubuntu".into(),
                        stemcell_version: "1.2".into(),
                        dependency_key: "dk".into(),
                        blob_id: format!("compiled-{name}"),
                        digest: "cd".into(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn packages_section_uses_compiled_blobs() {
        let packages = vec![package("libuv")];
        let section = packages_section(&packages, "ubuntu/1.2", &compiled_map(&["libuv"])).unwrap();
        assert_eq!(section["libuv"]["blob_id"], "compiled-libuv");
        assert_eq!(section["libuv"]["fingerprint"], "fp-libuv");
    }

    #[test]
    fn packages_section_fails_on_missing_artifact() {
        let packages = vec![package("libuv")];
        let err = packages_section(&packages, "ubuntu/1.2", &CompiledMap::new()).unwrap_err();
        assert!(matches!(err, DirectorError::CompilationFailed { .. }));
    }

    #[test]
    fn identity_match_ignores_compiled_blob_but_not_fingerprint() {
        let packages = vec![package("libuv")];
        let state = json!({
            "packages": {
                "libuv": {
                    "version": "1",
                    "fingerprint": "fp-libuv",
                    "blob_id": "some-older-compile",
                }
            }
        });
        assert!(packages_identity_matches(&state, &packages));

        let changed = json!({
            "packages": {
                "libuv": { "version": "1", "fingerprint": "fp-other" }
            }
        });
        assert!(!packages_identity_matches(&changed, &packages));

        let extra = json!({
            "packages": {
                "libuv": { "version": "1", "fingerprint": "fp-libuv" },
                "gone": { "version": "9", "fingerprint": "fp-gone" },
            }
        });
        assert!(!packages_identity_matches(&extra, &packages));
    }
}
