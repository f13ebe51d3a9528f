use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use tether_core::{ClusterId, ListOptions, OperationType, PatchKind, ResolvedKind, TetherError, TetherResult};
use tether_kubehub::{sort_by_creation_desc, strip_managed_fields, ClusterBackend};
use tether_pipeline::Interceptor;

/// What a statement produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Output {
    Object(Value),
    List(Vec<Value>),
    Deleted,
}

impl Output {
    pub fn into_value(self) -> Value {
        match self {
            Output::Object(v) => v,
            Output::List(items) => Value::Array(items),
            Output::Deleted => Value::Null,
        }
    }

    pub fn into_object(self) -> Option<Value> {
        match self {
            Output::Object(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Value>> {
        match self {
            Output::List(items) => Some(items),
            _ => None,
        }
    }
}

/// One resource operation on its way through the interceptor chain.
///
/// Interceptors may inspect and rewrite every public field; the terminal `dispatch`
/// handler reads them when it makes the call and fills `result`.
pub struct ResourceStatement {
    pub id: Uuid,
    pub cluster: ClusterId,
    pub target: ResolvedKind,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub operation: OperationType,
    pub list_options: ListOptions,
    pub payload: Option<Value>,
    pub patch_kind: PatchKind,
    pub result: Option<Output>,
    backend: Arc<dyn ClusterBackend>,
}

impl fmt::Debug for ResourceStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceStatement")
            .field("id", &self.id)
            .field("cluster", &self.cluster)
            .field("gvr", &self.target.gvr.to_string())
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("operation", &self.operation)
            .finish()
    }
}

impl ResourceStatement {
    pub(crate) fn new(
        cluster: ClusterId,
        target: ResolvedKind,
        operation: OperationType,
        backend: Arc<dyn ClusterBackend>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster,
            target,
            namespace: None,
            name: None,
            operation,
            list_options: ListOptions::default(),
            payload: None,
            patch_kind: PatchKind::Merge,
            result: None,
            backend,
        }
    }

    /// Backend the statement will be dispatched to.
    pub fn backend(&self) -> &Arc<dyn ClusterBackend> {
        &self.backend
    }

    fn require_name(&self) -> TetherResult<String> {
        self.name
            .clone()
            .or_else(|| self.payload.as_ref().and_then(|p| p.pointer("/metadata/name")).and_then(Value::as_str).map(str::to_string))
            .filter(|n| !n.is_empty())
            .ok_or_else(|| TetherError::InvalidRequest(format!("{} {} requires a name", self.operation, self.target.kind)))
    }

    fn require_payload(&self) -> TetherResult<&Value> {
        self.payload
            .as_ref()
            .ok_or_else(|| TetherError::InvalidRequest(format!("{} {} requires a payload", self.operation, self.target.kind)))
    }

    /// The concrete backend call for this statement.
    pub(crate) async fn perform(&self) -> TetherResult<Output> {
        let ns = self.namespace.as_deref();
        let t = &self.target;
        let out = match self.operation {
            OperationType::Get => {
                let name = self.require_name()?;
                Output::Object(self.backend.get(t, ns, &name).await?)
            }
            OperationType::List => {
                let mut items = self.backend.list(t, ns, &self.list_options).await?;
                items.iter_mut().for_each(strip_managed_fields);
                sort_by_creation_desc(&mut items);
                return Ok(Output::List(items));
            }
            OperationType::Create => Output::Object(self.backend.create(t, ns, self.require_payload()?).await?),
            OperationType::Update => {
                let name = self.require_name()?;
                Output::Object(self.backend.update(t, ns, &name, self.require_payload()?).await?)
            }
            OperationType::Patch => {
                let name = self.require_name()?;
                Output::Object(self.backend.patch(t, ns, &name, self.patch_kind, self.require_payload()?).await?)
            }
            OperationType::Delete => {
                let name = self.require_name()?;
                self.backend.delete(t, ns, &name).await?;
                Output::Deleted
            }
        };
        Ok(match out {
            Output::Object(mut v) => {
                strip_managed_fields(&mut v);
                Output::Object(v)
            }
            other => other,
        })
    }
}

/// Terminal handler installed in every chain.
pub(crate) struct DispatchHandler;

#[async_trait::async_trait]
impl Interceptor<ResourceStatement> for DispatchHandler {
    async fn handle(&self, stmt: &mut ResourceStatement) -> anyhow::Result<()> {
        let out = stmt.perform().await?;
        debug!(stmt = %stmt.id, op = %stmt.operation, gvr = %stmt.target.gvr, "dispatched");
        stmt.result = Some(out);
        Ok(())
    }
}
