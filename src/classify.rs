//! Error classification for `retry_on`/`abort_on`, `fail_on`/`skip_on` and `apply_on`/`skip_on`.
//!
//! An [`ErrorClass`] is a named predicate over `dyn Error`. Classes are usually concrete types
//! (`ErrorClass::of::<io::Error>()`), one of the engine's own failure kinds
//! (`ErrorClass::timeout()`), or the catch-all `ErrorClass::any()`.

use crate::error::ResilienceError;
use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

type Matcher = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

/// A named predicate that decides whether an error belongs to a class.
#[derive(Clone)]
pub struct ErrorClass {
    name: Cow<'static, str>,
    matcher: Matcher,
}

impl ErrorClass {
    /// Matches every error.
    pub fn any() -> Self {
        Self::matching("any", |_| true)
    }

    /// Matches errors whose concrete type is `T`.
    pub fn of<T>() -> Self
    where
        T: Error + 'static,
    {
        Self {
            name: Cow::Borrowed(std::any::type_name::<T>()),
            matcher: Arc::new(|err: &(dyn Error + 'static)| err.is::<T>()),
        }
    }

    /// Matches any engine-originated [`ResilienceError`].
    pub fn resilience() -> Self {
        Self::of::<ResilienceError>()
    }

    /// Matches [`ResilienceError::Timeout`].
    pub fn timeout() -> Self {
        Self::resilience_variant("timeout", ResilienceError::is_timeout)
    }

    /// Matches [`ResilienceError::Bulkhead`].
    pub fn bulkhead() -> Self {
        Self::resilience_variant("bulkhead", ResilienceError::is_bulkhead)
    }

    /// Matches [`ResilienceError::CircuitOpen`].
    pub fn circuit_open() -> Self {
        Self::resilience_variant("circuit_open", ResilienceError::is_circuit_open)
    }

    /// Matches errors accepted by an arbitrary predicate.
    pub fn matching<N, F>(name: N, predicate: F) -> Self
    where
        N: Into<Cow<'static, str>>,
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        Self { name: name.into(), matcher: Arc::new(predicate) }
    }

    fn resilience_variant(name: &'static str, check: fn(&ResilienceError) -> bool) -> Self {
        Self::matching(name, move |err| err.downcast_ref::<ResilienceError>().is_some_and(check))
    }

    /// Name used in logs and `Debug` output.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `err` belongs to this class.
    pub fn matches(&self, err: &(dyn Error + 'static)) -> bool {
        (self.matcher)(err)
    }
}

impl fmt::Debug for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorClass").field(&self.name).finish()
    }
}

/// An ordered set of error classes; an error matches the set if it matches any member.
#[derive(Clone, Debug, Default)]
pub struct ErrorClassSet {
    classes: Vec<ErrorClass>,
}

impl ErrorClassSet {
    /// The empty set; matches nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A set containing only [`ErrorClass::any`].
    pub fn any() -> Self {
        Self { classes: vec![ErrorClass::any()] }
    }

    /// Add a class to the set.
    pub fn with(mut self, class: ErrorClass) -> Self {
        self.classes.push(class);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether any member class matches `err`.
    pub fn matches(&self, err: &(dyn Error + 'static)) -> bool {
        self.classes.iter().any(|class| class.matches(err))
    }
}

impl FromIterator<ErrorClass> for ErrorClassSet {
    fn from_iter<I: IntoIterator<Item = ErrorClass>>(iter: I) -> Self {
        Self { classes: iter.into_iter().collect() }
    }
}

impl From<ErrorClass> for ErrorClassSet {
    fn from(class: ErrorClass) -> Self {
        Self { classes: vec![class] }
    }
}
