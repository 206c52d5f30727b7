//! Services and their method tables.
//!
//! A service is a named receiver plus a table of callable methods. Methods
//! are declared explicitly through a [`ServiceBuilder`]; only methods with an
//! exported name (ASCII uppercase first letter, identifier characters) are
//! kept. Ineligible methods are skipped, not rejected.
//!
//! # Example
//!
//! ```rust
//! use corelib::service::{Receiver, Service, ServiceBuilder};
//!
//! struct Arith;
//!
//! impl Receiver for Arith {
//!     fn register(builder: ServiceBuilder<Self>) -> ServiceBuilder<Self> {
//!         builder.method("Multiply", |_, (a, b): (i64, i64)| async move {
//!             Ok::<_, String>(a * b)
//!         })
//!     }
//! }
//!
//! let service = Service::new(Arith).unwrap();
//! assert_eq!(service.name(), "Arith");
//! assert!(service.method("Multiply").is_some());
//! ```

pub mod method;
pub mod registry;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

pub use method::{BoxFuture, Invocation, MethodType, Reply};
pub use registry::Registry;

/// A type that can be exposed as a service.
///
/// The service name defaults to the type's own name without its module path.
pub trait Receiver: Send + Sync + Sized + 'static {
    fn service_name(&self) -> String {
        short_type_name::<Self>().to_string()
    }

    /// Declare the methods this receiver exposes.
    fn register(builder: ServiceBuilder<Self>) -> ServiceBuilder<Self>;
}

/// A registered receiver and its method table.
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: BTreeMap<String, Arc<MethodType>>,
}

impl Service {
    /// Build a service from a [`Receiver`].
    pub fn new<T: Receiver>(receiver: T) -> Result<Self> {
        let name = receiver.service_name();
        T::register(Self::builder(name, receiver)).build()
    }

    /// Start declaring a service by hand.
    pub fn builder<S>(name: impl Into<String>, receiver: S) -> ServiceBuilder<S>
    where
        S: Send + Sync + 'static,
    {
        ServiceBuilder {
            name: name.into(),
            receiver: Arc::new(receiver),
            methods: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&Arc<MethodType>> {
        self.methods.get(name)
    }

    /// Methods in name order.
    pub fn methods(&self) -> impl Iterator<Item = &Arc<MethodType>> {
        self.methods.values()
    }
}

/// Collects the method table of a service.
pub struct ServiceBuilder<S> {
    name: String,
    receiver: Arc<S>,
    methods: BTreeMap<String, Arc<MethodType>>,
}

impl<S> ServiceBuilder<S>
where
    S: Send + Sync + 'static,
{
    /// Add a method with shape `(receiver, args) -> Result<reply, error>`.
    ///
    /// Methods whose name is not exported are skipped. A later method with
    /// the same name replaces an earlier one.
    pub fn method<A, R, E, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        if !is_exported(name) {
            tracing::debug!(service = %self.name, method = name, "skipping unexported method");
            return self;
        }
        let method = MethodType::new(name.to_string(), Arc::clone(&self.receiver), handler);
        tracing::debug!(
            service = %self.name,
            method = name,
            arg_type = method.arg_type(),
            reply_type = method.reply_type(),
            "register method"
        );
        self.methods.insert(name.to_string(), Arc::new(method));
        self
    }

    /// Finish the service.
    ///
    /// Fails with [`Error::InvalidServiceName`] if the name is not exported.
    pub fn build(self) -> Result<Service> {
        if !is_exported(&self.name) {
            return Err(Error::InvalidServiceName(self.name));
        }
        Ok(Service {
            name: self.name,
            methods: self.methods,
        })
    }
}

/// True for names starting with an ASCII uppercase letter and made of
/// identifier characters only.
pub fn is_exported(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// `my_crate::module::Arith<T>` -> `Arith`
fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
