//! Bundle loading: resolves an OCI
//! bundle directory into a parsed `config.json` and the container-type
//! annotation the dispatcher needs to decide sandbox-vs-pod-container.
//!
//! `original_source` for this shim was not available to check exact
//! symlink-resolution ordering against, so the order below — canonicalize
//! the bundle path, then read `config.json` from the canonical path —
//! is taken from the requirement that a malformed
//! bundle must fail as `InvalidArgument`, not `Internal`: resolving the
//! path first means a dangling symlink surfaces as a normal not-found
//! read error rather than a canonicalize error with a different shape.

use std::path::{Path, PathBuf};

use oci_spec::runtime::Spec;

use crate::error::{Error, Result};

pub const SANDBOX_ANNOTATION: &str = "io.kubernetes.cri.sandbox-id";
pub const CONTAINER_TYPE_ANNOTATION: &str = "io.kubernetes.cri.container-type";
pub const CONTAINER_TYPE_SANDBOX: &str = "sandbox";
pub const CONTAINER_TYPE_CONTAINER: &str = "container";

pub struct LoadedBundle {
    pub bundle: PathBuf,
    pub spec: Spec,
    pub sandbox_id: Option<String>,
    pub is_sandbox: bool,
}

/// Loads and parses a bundle's `config.json`. `id` must be non-empty and
/// `bundle` must be an absolute path to an existing directory; both are
/// checked before any filesystem access beyond that.
///
/// Regardless of container type, any `pid` namespace entry is stripped
/// from the parsed spec before it is handed back, and a blank network
/// namespace path is filled in from `cli_netns` when one is given.
pub fn load(id: &str, bundle: &Path, cli_netns: Option<&str>) -> Result<LoadedBundle> {
    if id.is_empty() {
        return Err(Error::InvalidArgument("container id must not be empty".into()));
    }
    if bundle.as_os_str().is_empty() {
        return Err(Error::InvalidArgument("bundle path must not be empty".into()));
    }
    if !bundle.is_absolute() {
        return Err(Error::InvalidArgument(format!(
            "bundle path {bundle:?} must be absolute"
        )));
    }

    let resolved = bundle
        .canonicalize()
        .map_err(|err| Error::InvalidArgument(format!("bundle {bundle:?} could not be resolved: {err}")))?;

    let config_path = resolved.join("config.json");
    let mut spec = Spec::load(&config_path)
        .map_err(|err| Error::InvalidArgument(format!("{config_path:?}: {err}")))?;

    strip_pid_namespace(&mut spec);
    normalize_netns(&mut spec, cli_netns);

    let annotations = spec.annotations().clone().unwrap_or_default();
    let sandbox_id = annotations.get(SANDBOX_ANNOTATION).cloned();
    let is_sandbox = match annotations.get(CONTAINER_TYPE_ANNOTATION).map(String::as_str) {
        Some(CONTAINER_TYPE_SANDBOX) => true,
        Some(CONTAINER_TYPE_CONTAINER) => false,
        Some(other) => {
            return Err(Error::InvalidArgument(format!(
                "unrecognized {CONTAINER_TYPE_ANNOTATION}: {other}"
            )))
        }
        // Absent annotation: treat as a standalone sandbox container,
        // default for non-CRI callers.
        None => true,
    };

    Ok(LoadedBundle {
        bundle: resolved,
        spec,
        sandbox_id,
        is_sandbox,
    })
}

/// Containers never run their own pid namespace here; the backend owns
/// process lifecycle on its own terms, so forwarding a `pid` namespace
/// entry from the bundle would be misleading at best.
fn strip_pid_namespace(spec: &mut Spec) {
    use oci_spec::runtime::LinuxNamespaceType;

    let Some(mut linux) = spec.linux().clone() else { return };
    let Some(namespaces) = linux.namespaces().clone() else { return };

    let filtered: Vec<_> = namespaces
        .into_iter()
        .filter(|ns| !matches!(ns.typ(), LinuxNamespaceType::Pid))
        .collect();

    linux.set_namespaces(Some(filtered));
    spec.set_linux(Some(linux));
}

/// Fills in a blank network namespace path with the CLI-supplied netns,
/// if the bundle didn't already specify one of its own.
fn normalize_netns(spec: &mut Spec, cli_netns: Option<&str>) {
    use oci_spec::runtime::LinuxNamespaceType;

    let Some(cli_netns) = cli_netns else { return };
    let Some(mut linux) = spec.linux().clone() else { return };
    let Some(mut namespaces) = linux.namespaces().clone() else { return };

    for ns in namespaces.iter_mut() {
        if !matches!(ns.typ(), LinuxNamespaceType::Network) {
            continue;
        }
        let blank = ns.path().as_ref().map(|p| p.as_os_str().is_empty()).unwrap_or(true);
        if blank {
            ns.set_path(Some(PathBuf::from(cli_netns)));
        }
    }

    linux.set_namespaces(Some(namespaces));
    spec.set_linux(Some(linux));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use oci_spec::runtime::{LinuxBuilder, LinuxNamespaceBuilder, LinuxNamespaceType, SpecBuilder};

    fn write_bundle(dir: &Path, annotations: HashMap<String, String>) {
        let spec = SpecBuilder::default()
            .annotations(annotations)
            .build()
            .unwrap();
        spec.save(dir.join("config.json")).unwrap();
    }

    fn write_bundle_with_namespaces(dir: &Path, namespaces: Vec<oci_spec::runtime::LinuxNamespace>) {
        let linux = LinuxBuilder::default().namespaces(namespaces).build().unwrap();
        let spec = SpecBuilder::default().linux(linux).build().unwrap();
        spec.save(dir.join("config.json")).unwrap();
    }

    #[test]
    fn empty_id_is_invalid_argument() {
        let err = load("", &PathBuf::from("/tmp"), None).unwrap_err();
        assert_eq!(err.code(), crate::error::Code::InvalidArgument);
    }

    #[test]
    fn relative_bundle_is_invalid_argument() {
        let err = load("c1", &PathBuf::from("relative/path"), None).unwrap_err();
        assert_eq!(err.code(), crate::error::Code::InvalidArgument);
    }

    #[test]
    fn missing_bundle_is_invalid_argument() {
        let err = load("c1", &PathBuf::from("/no/such/bundle/dir"), None).unwrap_err();
        assert_eq!(err.code(), crate::error::Code::InvalidArgument);
    }

    #[test]
    fn container_type_annotation_picks_kind() {
        let dir = tempfile::tempdir().unwrap();
        let mut annotations = HashMap::new();
        annotations.insert(CONTAINER_TYPE_ANNOTATION.to_string(), CONTAINER_TYPE_CONTAINER.to_string());
        annotations.insert(SANDBOX_ANNOTATION.to_string(), "sbx-1".to_string());
        write_bundle(dir.path(), annotations);

        let loaded = load("c1", dir.path(), None).unwrap();
        assert!(!loaded.is_sandbox);
        assert_eq!(loaded.sandbox_id.as_deref(), Some("sbx-1"));
    }

    #[test]
    fn unrecognized_container_type_is_invalid_argument() {
        let dir = tempfile::tempdir().unwrap();
        let mut annotations = HashMap::new();
        annotations.insert(CONTAINER_TYPE_ANNOTATION.to_string(), "bogus".to_string());
        write_bundle(dir.path(), annotations);

        let err = load("c1", dir.path(), None).unwrap_err();
        assert_eq!(err.code(), crate::error::Code::InvalidArgument);
    }

    #[test]
    fn pid_namespace_is_stripped_regardless_of_cli_netns() {
        let dir = tempfile::tempdir().unwrap();
        let namespaces = vec![
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Pid)
                .build()
                .unwrap(),
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Uts)
                .build()
                .unwrap(),
        ];
        write_bundle_with_namespaces(dir.path(), namespaces);

        let loaded = load("c1", dir.path(), None).unwrap();
        let remaining = loaded.spec.linux().clone().unwrap().namespaces().clone().unwrap();
        assert!(!remaining.iter().any(|ns| matches!(ns.typ(), LinuxNamespaceType::Pid)));
        assert!(remaining.iter().any(|ns| matches!(ns.typ(), LinuxNamespaceType::Uts)));
    }

    #[test]
    fn blank_netns_is_filled_from_cli_override() {
        let dir = tempfile::tempdir().unwrap();
        let namespaces = vec![LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Network)
            .build()
            .unwrap()];
        write_bundle_with_namespaces(dir.path(), namespaces);

        let loaded = load("c1", dir.path(), Some("/var/run/netns/cli-ns")).unwrap();
        let remaining = loaded.spec.linux().clone().unwrap().namespaces().clone().unwrap();
        let netns = remaining
            .iter()
            .find(|ns| matches!(ns.typ(), LinuxNamespaceType::Network))
            .unwrap();
        assert_eq!(netns.path().as_deref(), Some(Path::new("/var/run/netns/cli-ns")));
    }

    #[test]
    fn netns_with_existing_path_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let namespaces = vec![LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Network)
            .path(PathBuf::from("/var/run/netns/bundle-ns"))
            .build()
            .unwrap()];
        write_bundle_with_namespaces(dir.path(), namespaces);

        let loaded = load("c1", dir.path(), Some("/var/run/netns/cli-ns")).unwrap();
        let remaining = loaded.spec.linux().clone().unwrap().namespaces().clone().unwrap();
        let netns = remaining
            .iter()
            .find(|ns| matches!(ns.typ(), LinuxNamespaceType::Network))
            .unwrap();
        assert_eq!(netns.path().as_deref(), Some(Path::new("/var/run/netns/bundle-ns")));
    }
}
