//! Well-known lock names.

/// Serializes all mutating tasks against one deployment.
pub fn deployment(name: &str) -> String {
    format!("lock:deployment:{name}")
}

/// Guards release upload and deletion.
pub fn release() -> String {
    "lock:release".to_string()
}

/// Guards stemcell upload and deletion.
pub fn stemcells() -> String {
    "lock:stemcells".to_string()
}

/// Deduplicates compilation of one package on one stemcell across
/// concurrent deployments.
pub fn compile(package: &str, stemcell: &str) -> String {
    format!("lock:compile:{package}:{stemcell}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_namespaced() {
        assert_eq!(deployment("prod"), "lock:deployment:prod");
        assert_eq!(release(), "lock:release");
        assert_eq!(stemcells(), "lock:stemcells");
        assert_eq!(
            compile("redis-server", "ubuntu/1.2"),
            "lock:compile:redis-server:ubuntu/1.2"
        );
    }
}
