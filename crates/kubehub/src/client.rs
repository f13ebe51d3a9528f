//! kube-rs backed connector and backend.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    config::KubeConfigOptions,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client, Config,
};
use serde_json::Value;
use tracing::{debug, info};

use tether_core::{
    ClusterConfig, ClusterSource, Gvr, ListOptions, PatchKind, ResolvedKind, TetherError, TetherResult,
};

use crate::{kubeconfig, with_type_meta, ClusterBackend, Connector, CrdInfo, CrdVersion};

const FIELD_MANAGER: &str = "tether";

fn map_kube_err(e: kube::Error, what: impl FnOnce() -> String) -> TetherError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => TetherError::NotFound(what()),
        kube::Error::Api(ae) => TetherError::Api { code: ae.code, message: ae.message },
        other => TetherError::transport(other),
    }
}

fn api_resource(target: &ResolvedKind) -> ApiResource {
    ApiResource {
        group: target.gvr.group.clone(),
        version: target.gvr.version.clone(),
        api_version: target.gvr.api_version(),
        kind: target.kind.clone(),
        plural: target.gvr.resource.clone(),
    }
}

fn parse_into<T>(slot: &mut Option<T>, s: &str) -> Result<(), String>
where
    T: FromStr,
    T::Err: Display,
{
    *slot = Some(s.parse().map_err(|e: T::Err| e.to_string())?);
    Ok(())
}

fn to_object(doc: &Value) -> TetherResult<DynamicObject> {
    serde_json::from_value(doc.clone()).map_err(|e| TetherError::InvalidRequest(format!("payload is not an object document: {}", e)))
}

fn to_value(obj: DynamicObject) -> TetherResult<Value> {
    serde_json::to_value(obj).map_err(TetherError::transport)
}

/// A kube-rs client bound to one cluster.
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, target: &ResolvedKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(target);
        match (target.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn describe(target: &ResolvedKind, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{} {}/{}", target.gvr, ns, name),
        None => format!("{} {}", target.gvr, name),
    }
}

#[async_trait::async_trait]
impl ClusterBackend for KubeBackend {
    async fn server_version(&self) -> TetherResult<String> {
        let info = self.client.apiserver_version().await.map_err(TetherError::transport)?;
        Ok(info.git_version)
    }

    async fn api_resources(&self) -> TetherResult<Vec<ResolvedKind>> {
        let t0 = Instant::now();
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(TetherError::transport)?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                out.push(ResolvedKind::builtin(ar.kind.clone(), Gvr::new(ar.group.clone(), ar.version.clone(), ar.plural.clone()), namespaced));
            }
        }
        info!(kinds = out.len(), took_ms = %t0.elapsed().as_millis(), "discovery complete");
        Ok(out)
    }

    async fn custom_resource_definitions(&self) -> TetherResult<Vec<CrdInfo>> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.map_err(|e| map_kube_err(e, || "customresourcedefinitions".into()))?;
        Ok(list
            .items
            .into_iter()
            .map(|crd| CrdInfo {
                group: crd.spec.group,
                kind: crd.spec.names.kind,
                plural: crd.spec.names.plural,
                namespaced: crd.spec.scope == "Namespaced",
                versions: crd
                    .spec
                    .versions
                    .into_iter()
                    .map(|v| CrdVersion { name: v.name, served: v.served, storage: v.storage })
                    .collect(),
            })
            .collect())
    }

    async fn get(&self, target: &ResolvedKind, namespace: Option<&str>, name: &str) -> TetherResult<Value> {
        let obj = self.api(target, namespace).get(name).await.map_err(|e| map_kube_err(e, || describe(target, namespace, name)))?;
        Ok(with_type_meta(to_value(obj)?, target))
    }

    async fn list(&self, target: &ResolvedKind, namespace: Option<&str>, opts: &ListOptions) -> TetherResult<Vec<Value>> {
        let mut lp = ListParams::default();
        if let Some(l) = &opts.label_selector {
            lp = lp.labels(l);
        }
        if let Some(f) = &opts.field_selector {
            lp = lp.fields(f);
        }
        if let Some(n) = opts.limit {
            lp = lp.limit(n);
        }
        let list = self.api(target, namespace).list(&lp).await.map_err(|e| map_kube_err(e, || target.gvr.to_string()))?;
        debug!(gvr = %target.gvr, ns = ?namespace, items = list.items.len(), "list");
        list.items.into_iter().map(|o| Ok(with_type_meta(to_value(o)?, target))).collect()
    }

    async fn create(&self, target: &ResolvedKind, namespace: Option<&str>, doc: &Value) -> TetherResult<Value> {
        let obj = to_object(doc)?;
        let created = self
            .api(target, namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err(e, || describe(target, namespace, obj.metadata.name.as_deref().unwrap_or(""))))?;
        to_value(created)
    }

    async fn update(&self, target: &ResolvedKind, namespace: Option<&str>, name: &str, doc: &Value) -> TetherResult<Value> {
        let obj = to_object(doc)?;
        let replaced = self
            .api(target, namespace)
            .replace(name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err(e, || describe(target, namespace, name)))?;
        to_value(replaced)
    }

    async fn patch(
        &self,
        target: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        kind: PatchKind,
        patch: &Value,
    ) -> TetherResult<Value> {
        let (pp, patch) = match kind {
            PatchKind::Merge => (PatchParams::default(), Patch::Merge(patch)),
            PatchKind::Strategic => (PatchParams::default(), Patch::Strategic(patch)),
            PatchKind::Apply => (PatchParams::apply(FIELD_MANAGER), Patch::Apply(patch)),
        };
        let patched = self
            .api(target, namespace)
            .patch(name, &pp, &patch)
            .await
            .map_err(|e| map_kube_err(e, || describe(target, namespace, name)))?;
        to_value(patched)
    }

    async fn delete(&self, target: &ResolvedKind, namespace: Option<&str>, name: &str) -> TetherResult<()> {
        self.api(target, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_err(e, || describe(target, namespace, name)))?;
        Ok(())
    }
}

/// Builds kube-rs clients from kubeconfig contexts or the in-cluster service account.
#[derive(Debug, Clone, Default)]
pub struct KubeConnector;

impl KubeConnector {
    pub fn new() -> Self {
        Self
    }

    async fn client_config(config: &ClusterConfig) -> TetherResult<Config> {
        let mut kc = match &config.source {
            ClusterSource::Kubeconfig { content, context } => {
                let parsed = kubeconfig::parse(content)?;
                let opts = KubeConfigOptions { context: Some(context.clone()), ..Default::default() };
                Config::from_custom_kubeconfig(parsed, &opts)
                    .await
                    .map_err(|e| TetherError::InvalidConfig(format!("context '{}': {}", context, e)))?
            }
            ClusterSource::InCluster => Config::incluster().map_err(|e| TetherError::InvalidConfig(format!("in-cluster: {}", e)))?,
        };
        let timeout = config.client.timeout();
        kc.connect_timeout = Some(timeout);
        kc.read_timeout = Some(timeout);
        if let Some(p) = &config.client.proxy_url {
            parse_into(&mut kc.proxy_url, p).map_err(|e| TetherError::InvalidConfig(format!("proxy url {}: {}", p, e)))?;
        }
        Ok(kc)
    }
}

#[async_trait::async_trait]
impl Connector for KubeConnector {
    async fn connect(&self, config: &ClusterConfig) -> TetherResult<Arc<dyn ClusterBackend>> {
        let kc = Self::client_config(config).await?;
        debug!(
            cluster = %config.id,
            qps = config.client.qps,
            burst = config.client.burst,
            timeout_secs = config.client.timeout_secs,
            "building client"
        );
        let client = Client::try_from(kc).map_err(|e| TetherError::Connection { cluster: config.id.clone(), message: e.to_string() })?;
        Ok(Arc::new(KubeBackend::new(client)))
    }

    fn endpoint(&self, config: &ClusterConfig) -> TetherResult<Option<String>> {
        match &config.source {
            ClusterSource::Kubeconfig { content, context } => kubeconfig::server_for(&kubeconfig::parse(content)?, context),
            ClusterSource::InCluster => Ok(std::env::var("KUBERNETES_SERVICE_HOST")
                .ok()
                .map(|h| format!("https://{}:{}", h, std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into())))),
        }
    }
}
