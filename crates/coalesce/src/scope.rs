//! Scoped acquisition of the producer.
//!
//! Every producer invocation runs against its own [`ResourceScope`]. The scope is created right
//! before the invocation and released on every exit path, whether the invocation succeeded,
//! failed or was cancelled.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

/// A resource scope rooting one strongly typed instance.
pub trait ResourceScope: Send + 'static {
    /// The instance this scope hands out.
    type Instance: Send + Sync + 'static;

    /// Resolves the instance rooted in this scope.
    fn instance(&self) -> anyhow::Result<Self::Instance>;

    /// Releases the scope and everything it owns.
    fn release(self) -> BoxFuture<'static, ()>;
}

/// Creates independent [`ResourceScope`]s.
pub trait ScopeFactory: Send + Sync + 'static {
    /// The scope type created by this factory.
    type Scope: ResourceScope;

    /// Creates a fresh scope that is not shared with any other caller.
    fn create_scope(&self) -> anyhow::Result<Self::Scope>;
}

/// The instance type produced by the scopes of a [`ScopeFactory`].
pub type InstanceOf<F> = <<F as ScopeFactory>::Scope as ResourceScope>::Instance;

/// A scope together with the instance it roots.
///
/// The scope is released exactly once: either explicitly through [`release`](Self::release), or,
/// if the guard is dropped before that, by spawning the release onto the current runtime.
pub struct OwnedScope<S: ResourceScope> {
    scope: Option<S>,
    instance: S::Instance,
}

impl<S: ResourceScope> OwnedScope<S> {
    /// Creates a new scope from `factory` and resolves its instance.
    ///
    /// If the instance cannot be resolved, the freshly created scope is released before the
    /// error is returned.
    pub async fn acquire<F>(factory: &F) -> anyhow::Result<Self>
    where
        F: ScopeFactory<Scope = S> + ?Sized,
    {
        let scope = factory.create_scope()?;
        match scope.instance() {
            Ok(instance) => Ok(Self {
                scope: Some(scope),
                instance,
            }),
            Err(err) => {
                scope.release().await;
                Err(err)
            }
        }
    }

    /// The instance rooted in this scope.
    pub fn instance(&self) -> &S::Instance {
        &self.instance
    }

    /// Releases the scope.
    pub async fn release(mut self) {
        if let Some(scope) = self.scope.take() {
            scope.release().await;
        }
    }
}

impl<S: ResourceScope> Drop for OwnedScope<S> {
    fn drop(&mut self) {
        let Some(scope) = self.scope.take() else {
            return;
        };

        tracing::debug!("Releasing producer scope on drop");
        let release = scope.release();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release);
            }
            // Outside of a runtime nothing async can be waiting on us.
            Err(_) => futures::executor::block_on(release),
        }
    }
}

impl<S: ResourceScope> fmt::Debug for OwnedScope<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedScope")
            .field("released", &self.scope.is_none())
            .finish_non_exhaustive()
    }
}

/// A [`ScopeFactory`] for producers that do not need any per-invocation resources.
///
/// Every scope hands out a clone of the same shared producer, and releasing it does nothing.
pub struct SharedScopeFactory<P> {
    instance: Arc<P>,
}

impl<P> SharedScopeFactory<P> {
    /// Creates a factory handing out `instance`.
    pub fn new(instance: P) -> Self {
        Self {
            instance: Arc::new(instance),
        }
    }

    /// Creates a factory handing out an already shared `instance`.
    pub fn from_arc(instance: Arc<P>) -> Self {
        Self { instance }
    }
}

impl<P> fmt::Debug for SharedScopeFactory<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedScopeFactory").finish_non_exhaustive()
    }
}

/// The scope created by a [`SharedScopeFactory`].
pub struct SharedScope<P> {
    instance: Arc<P>,
}

impl<P: Send + Sync + 'static> ResourceScope for SharedScope<P> {
    type Instance = Arc<P>;

    fn instance(&self) -> anyhow::Result<Self::Instance> {
        Ok(Arc::clone(&self.instance))
    }

    fn release(self) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

impl<P: Send + Sync + 'static> ScopeFactory for SharedScopeFactory<P> {
    type Scope = SharedScope<P>;

    fn create_scope(&self) -> anyhow::Result<Self::Scope> {
        Ok(SharedScope {
            instance: Arc::clone(&self.instance),
        })
    }
}
