//! Substituting a result when the guarded call fails.
//!
//! `skip_on` is checked first and wins over `apply_on`. An empty `apply_on` applies the fallback
//! to every failure that is not skipped. Successes are never replaced, and the fallback handler
//! itself is never retried.

use crate::classify::ErrorClassSet;
use crate::error::{BoxError, SharedError};
use crate::result::MethodResult;
use crate::telemetry::{FallbackEvent, MetricRecorder, PolicyEvent};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Application logic producing a substitute value from the context and the failure.
pub type FallbackHandler<R> =
    Arc<dyn Fn(&ExecutionContext, &SharedError) -> Result<R, BoxError> + Send + Sync>;

/// Metadata about the guarded invocation handed to fallback handlers.
#[derive(Clone)]
pub struct ExecutionContext {
    method: Arc<str>,
    arguments: Option<Arc<dyn Any + Send + Sync>>,
}

impl ExecutionContext {
    pub fn new(method: impl Into<Arc<str>>) -> Self {
        Self { method: method.into(), arguments: None }
    }

    /// Attach the invocation's arguments.
    pub fn with_arguments<T>(mut self, arguments: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.arguments = Some(Arc::new(arguments));
        self
    }

    /// Identifier of the guarded method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The attached arguments, if present and of type `T`.
    pub fn arguments<T: Any>(&self) -> Option<&T> {
        self.arguments.as_deref().and_then(|args| args.downcast_ref::<T>())
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("method", &self.method)
            .field("has_arguments", &self.arguments.is_some())
            .finish()
    }
}

/// Immutable fallback configuration.
pub struct FallbackPolicy<R> {
    handler: FallbackHandler<R>,
    apply_on: ErrorClassSet,
    skip_on: ErrorClassSet,
}

impl<R> FallbackPolicy<R> {
    pub fn builder<F>(handler: F) -> FallbackPolicyBuilder<R>
    where
        F: Fn(&ExecutionContext, &SharedError) -> Result<R, BoxError> + Send + Sync + 'static,
    {
        FallbackPolicyBuilder {
            handler: Arc::new(handler),
            apply_on: ErrorClassSet::empty(),
            skip_on: ErrorClassSet::empty(),
        }
    }

    pub fn apply_on(&self) -> &ErrorClassSet {
        &self.apply_on
    }

    pub fn skip_on(&self) -> &ErrorClassSet {
        &self.skip_on
    }

    fn applies_to(&self, err: &SharedError) -> bool {
        if self.skip_on.matches(&**err) {
            return false;
        }
        self.apply_on.is_empty() || self.apply_on.matches(&**err)
    }
}

impl<R> Clone for FallbackPolicy<R> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            apply_on: self.apply_on.clone(),
            skip_on: self.skip_on.clone(),
        }
    }
}

impl<R> fmt::Debug for FallbackPolicy<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackPolicy")
            .field("handler", &"<handler>")
            .field("apply_on", &self.apply_on)
            .field("skip_on", &self.skip_on)
            .finish()
    }
}

/// Builder for [`FallbackPolicy`].
pub struct FallbackPolicyBuilder<R> {
    handler: FallbackHandler<R>,
    apply_on: ErrorClassSet,
    skip_on: ErrorClassSet,
}

impl<R> FallbackPolicyBuilder<R> {
    /// Failures the fallback handles. Empty (the default) means every failure not skipped.
    pub fn apply_on(mut self, classes: impl Into<ErrorClassSet>) -> Self {
        self.apply_on = classes.into();
        self
    }

    /// Failures passed through untouched, even when they also match `apply_on`.
    pub fn skip_on(mut self, classes: impl Into<ErrorClassSet>) -> Self {
        self.skip_on = classes.into();
        self
    }

    pub fn build(self) -> FallbackPolicy<R> {
        FallbackPolicy { handler: self.handler, apply_on: self.apply_on, skip_on: self.skip_on }
    }
}

/// Per-invocation fallback decisions.
pub struct FallbackState<R> {
    kind: FallbackKind<R>,
}

enum FallbackKind<R> {
    Active { policy: FallbackPolicy<R>, recorder: Arc<dyn MetricRecorder> },
    Inert,
}

impl<R> FallbackState<R> {
    pub(crate) fn new(policy: FallbackPolicy<R>, recorder: Arc<dyn MetricRecorder>) -> Self {
        Self { kind: FallbackKind::Active { policy, recorder } }
    }

    pub(crate) fn inert() -> Self {
        Self { kind: FallbackKind::Inert }
    }

    /// Whether `result` should be replaced by the fallback.
    pub fn should_apply_fallback(&self, result: &MethodResult<R>) -> bool {
        match (&self.kind, result) {
            (FallbackKind::Active { policy, .. }, MethodResult::Failure(err)) => {
                policy.applies_to(err)
            }
            _ => false,
        }
    }

    /// Invoke the handler for a failed `result` and wrap what it returns.
    ///
    /// Successes, and every result of the inert variant, are returned unchanged.
    pub fn run_fallback(&self, result: MethodResult<R>, context: &ExecutionContext) -> MethodResult<R> {
        let (policy, recorder) = match &self.kind {
            FallbackKind::Active { policy, recorder } => (policy, recorder),
            FallbackKind::Inert => return result,
        };
        let err = match result {
            MethodResult::Failure(err) => err,
            success => return success,
        };

        tracing::debug!(method = context.method(), error = %err, "applying fallback");
        let substituted = MethodResult::from_result((policy.handler)(context, &err));
        recorder.record(&PolicyEvent::Fallback(FallbackEvent::Applied {
            succeeded: substituted.is_success(),
        }));
        substituted
    }

    /// False for the inert variant built when no fallback policy is configured.
    pub fn is_active(&self) -> bool {
        matches!(self.kind, FallbackKind::Active { .. })
    }
}

impl<R> fmt::Debug for FallbackState<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FallbackKind::Active { policy, .. } => {
                f.debug_struct("FallbackState").field("policy", policy).finish()
            }
            FallbackKind::Inert => f.write_str("FallbackState(inert)"),
        }
    }
}
