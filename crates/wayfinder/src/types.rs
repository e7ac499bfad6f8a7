//! Core vocabulary: routes, state, commands, params, and controller keys.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Navigation state produced by the router.
///
/// Opaque to the engine: it is only handed to
/// [`Controller::derive_params`](crate::Controller::derive_params).
///
/// Auto-implemented for every `Clone + Send + Sync + 'static` type.
pub trait Route: Clone + Send + Sync + 'static {}

impl<T> Route for T where T: Clone + Send + Sync + 'static {}

/// The whole application state tree held by the [`Store`](crate::Store).
///
/// `Clone` is required so lifecycle hooks can run against a working copy
/// that is only committed when the hook succeeds.
pub trait State: Clone + Send + Sync + 'static {}

impl<T> State for T where T: Clone + Send + Sync + 'static {}

/// Command payload delivered to a controller's inbox.
///
/// One command type per engine; the engine never inspects it.
pub trait Command: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Command for T where T: Clone + fmt::Debug + Send + Sync + 'static {}

/// Per-controller value derived from the current route.
///
/// Equality is structural (`PartialEq`). Two routes that derive equal params
/// leave a running controller untouched.
pub trait Params: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {}

impl<T> Params for T where T: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {}

/// Object-safe view of [`Params`] so controllers with different param types
/// can be diffed through one interface.
pub(crate) trait AnyParams: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn eq_dyn(&self, other: &dyn AnyParams) -> bool;
}

impl<P: Params> AnyParams for P {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_dyn(&self, other: &dyn AnyParams) -> bool {
        other
            .as_any()
            .downcast_ref::<P>()
            .is_some_and(|other| self == other)
    }
}

impl PartialEq for dyn AnyParams {
    fn eq(&self, other: &Self) -> bool {
        self.eq_dyn(other)
    }
}

/// Unique, process-stable identifier of a registered controller.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControllerKey(Arc<str>);

impl ControllerKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl Borrow<str> for ControllerKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ControllerKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ControllerKey {
    fn from(key: &str) -> Self {
        Self(Arc::from(key))
    }
}

impl From<String> for ControllerKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

impl From<&ControllerKey> for ControllerKey {
    fn from(key: &ControllerKey) -> Self {
        key.clone()
    }
}

impl PartialEq<str> for ControllerKey {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for ControllerKey {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}
