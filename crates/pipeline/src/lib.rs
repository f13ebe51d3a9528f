//! Tether pipeline: named interceptors with partial-order `before`/`after` constraints,
//! compiled into a linear chain and executed against one statement at a time.
//!
//! The compiled chain is an immutable snapshot behind an `ArcSwap`. Registration changes
//! recompile under a lock and swap the snapshot only when compilation succeeds, so an
//! in-flight `execute` keeps the chain it started with and a rejected registration leaves
//! the previous chain serving.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use metrics::counter;
use tracing::{debug, error, info};

mod compile;

pub use compile::CompileError;
use compile::{Entry, Registration};

/// Constraint target meaning "every other interceptor".
pub const WILDCARD: &str = "*";

/// A hook run against a statement. Returning an error stops the chain.
#[async_trait::async_trait]
pub trait Interceptor<S>: Send + Sync {
    async fn handle(&self, stmt: &mut S) -> anyhow::Result<()>;
}

/// Adapter turning a synchronous closure into an interceptor.
pub struct FnInterceptor<F>(F);

#[async_trait::async_trait]
impl<S, F> Interceptor<S> for FnInterceptor<F>
where
    S: Send + 'static,
    F: Fn(&mut S) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, stmt: &mut S) -> anyhow::Result<()> {
        (self.0)(stmt)
    }
}

/// Wrap a closure as a shareable interceptor handle.
pub fn interceptor_fn<S, F>(f: F) -> Arc<dyn Interceptor<S>>
where
    S: Send + 'static,
    F: Fn(&mut S) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnInterceptor(f))
}

/// Placement and mutation flags for one registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    pub before: Option<String>,
    pub after: Option<String>,
    /// Swap the handler of an existing registration, keeping its position constraints.
    pub replace: bool,
    /// Drop every registration with this name.
    pub remove: bool,
}

impl RegisterOptions {
    pub fn before(mut self, target: impl Into<String>) -> Self {
        self.before = Some(target.into());
        self
    }

    pub fn after(mut self, target: impl Into<String>) -> Self {
        self.after = Some(target.into());
        self
    }

    pub fn replace(mut self) -> Self {
        self.replace = true;
        self
    }

    pub fn remove(mut self) -> Self {
        self.remove = true;
        self
    }
}

/// Compiled, immutable execution order.
pub struct Chain<S> {
    entries: Vec<(String, Arc<dyn Interceptor<S>>)>,
}

impl<S> Default for Chain<S> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<S> Chain<S> {
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Registration set plus its compiled chain for one operation category.
pub struct Pipeline<S> {
    label: String,
    entries: Mutex<Vec<Entry<S>>>,
    chain: ArcSwap<Chain<S>>,
}

impl<S: Send + 'static> Pipeline<S> {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), entries: Mutex::new(Vec::new()), chain: ArcSwap::from_pointee(Chain::default()) }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Append an interceptor with no ordering constraint.
    pub fn register(&self, name: &str, handler: Arc<dyn Interceptor<S>>) -> Result<(), CompileError> {
        self.apply(name, Some(handler), RegisterOptions::default())
    }

    pub fn register_with(&self, name: &str, handler: Arc<dyn Interceptor<S>>, opts: RegisterOptions) -> Result<(), CompileError> {
        self.apply(name, Some(handler), opts)
    }

    pub fn replace(&self, name: &str, handler: Arc<dyn Interceptor<S>>) -> Result<(), CompileError> {
        self.apply(name, Some(handler), RegisterOptions::default().replace())
    }

    pub fn remove(&self, name: &str) -> Result<(), CompileError> {
        self.apply(name, None, RegisterOptions::default().remove())
    }

    /// Commit one registration change and recompile. On error nothing changes.
    pub fn apply(&self, name: &str, handler: Option<Arc<dyn Interceptor<S>>>, opts: RegisterOptions) -> Result<(), CompileError> {
        let registration = if opts.remove {
            Registration::Remove(name.to_string())
        } else {
            let handler = handler.ok_or_else(|| CompileError::MissingHandler(name.to_string()))?;
            Registration::Add {
                entry: Entry { name: name.to_string(), handler, before: opts.before, after: opts.after },
                replace: opts.replace,
            }
        };

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        counter!("pipeline_compile_total", 1u64);
        match compile::compile(&entries, registration) {
            Ok((next_entries, chain)) => {
                info!(pipeline = %self.label, name = %name, order = ?chain.names(), "interceptor chain compiled");
                *entries = next_entries;
                self.chain.store(Arc::new(chain));
                Ok(())
            }
            Err(e) => {
                counter!("pipeline_compile_err_total", 1u64);
                error!(pipeline = %self.label, name = %name, error = %e, "interceptor chain compile failed; keeping previous chain");
                Err(e)
            }
        }
    }

    /// Current compiled chain snapshot.
    pub fn chain(&self) -> Arc<Chain<S>> {
        self.chain.load_full()
    }

    pub fn names(&self) -> Vec<String> {
        self.chain.load().names().into_iter().map(str::to_string).collect()
    }

    /// Run every interceptor in compiled order; the first error is returned unchanged.
    pub async fn execute(&self, stmt: &mut S) -> anyhow::Result<()> {
        let chain = self.chain.load_full();
        for (name, handler) in chain.entries.iter() {
            if let Err(e) = handler.handle(stmt).await {
                debug!(pipeline = %self.label, interceptor = %name, error = %e, "interceptor stopped the chain");
                return Err(e);
            }
        }
        Ok(())
    }
}
