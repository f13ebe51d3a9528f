//! Kubeconfig document helpers.

use kube::config::Kubeconfig;
use tether_core::{ClusterConfig, TetherError, TetherResult};

pub fn parse(content: &str) -> TetherResult<Kubeconfig> {
    Kubeconfig::from_yaml(content).map_err(|e| TetherError::InvalidConfig(format!("kubeconfig: {}", e)))
}

/// Context names in document order.
pub fn contexts(content: &str) -> TetherResult<Vec<String>> {
    Ok(parse(content)?.contexts.into_iter().map(|c| c.name).collect())
}

pub fn current_context(content: &str) -> TetherResult<Option<String>> {
    Ok(parse(content)?.current_context)
}

/// API server URL for `context`: context -> cluster -> server.
pub fn server_for(kc: &Kubeconfig, context: &str) -> TetherResult<Option<String>> {
    let named = kc
        .contexts
        .iter()
        .find(|c| c.name == context)
        .ok_or_else(|| TetherError::InvalidConfig(format!("context '{}' not found in kubeconfig", context)))?;
    let Some(cluster_name) = named.context.as_ref().map(|c| c.cluster.as_str()) else {
        return Ok(None);
    };
    Ok(kc
        .clusters
        .iter()
        .find(|c| c.name == cluster_name)
        .and_then(|c| c.cluster.as_ref())
        .and_then(|c| c.server.clone()))
}

/// One config per context in the document, all tagged with `file`.
pub fn configs_for_all_contexts(file: &str, content: &str) -> TetherResult<Vec<ClusterConfig>> {
    let names = contexts(content)?;
    if names.is_empty() {
        return Err(TetherError::InvalidConfig(format!("kubeconfig {} has no contexts", file)));
    }
    Ok(names.into_iter().map(|ctx| ClusterConfig::from_kubeconfig(file, ctx, content)).collect())
}

#[cfg(test)]
pub(crate) const SAMPLE: &str = r#"
apiVersion: v1
kind: Config
current-context: kind-dev
clusters:
- name: dev
  cluster:
    server: https://127.0.0.1:6443
- name: prod
  cluster:
    server: https://prod.example.com
contexts:
- name: kind-dev
  context:
    cluster: dev
    user: dev-admin
- name: prod-admin
  context:
    cluster: prod
    user: prod-admin
users:
- name: dev-admin
  user:
    token: abc
- name: prod-admin
  user:
    token: def
"#;
