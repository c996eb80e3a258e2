//! Backend registry for scheme-based backend resolution.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use url::Url;

use crate::backend::Backend;
use crate::config::{StorageConfig, PASSPHRASE_ENV};
use crate::crypt::CryptBackend;
use crate::file::FileBackend;
use crate::memory::MemoryBackend;
use cairn_common::{Error, Result};

/// Everything a factory gets to build one backend instance.
pub struct BackendRequest<'a> {
    /// Parsed location. For decorators this is the outer `scheme:inner` URL.
    pub url: &'a Url,
    pub config: &'a StorageConfig,
    /// The already resolved inner backend. Set only for decorators.
    pub inner: Option<Box<dyn Backend>>,
}

impl BackendRequest<'_> {
    /// Take the inner backend a decorator wraps.
    ///
    /// # Errors
    /// - `InvalidRepositoryUrl` if nothing was resolved to wrap
    pub fn take_inner(&mut self) -> Result<Box<dyn Backend>> {
        self.inner.take().ok_or_else(|| {
            Error::InvalidRepositoryUrl(format!("{} does not name a location to wrap", self.url))
        })
    }
}

/// Factory function type for creating backends.
pub type BackendFactory =
    Box<dyn Fn(BackendRequest<'_>) -> Result<Box<dyn Backend>> + Send + Sync>;

/// Whether a family stores data itself or wraps another backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Storage,
    Decorator,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            BackendKind::Storage => "storage",
            BackendKind::Decorator => "decorator",
        })
    }
}

/// One backend family: its schemes, label and factory.
pub struct BackendDescriptor {
    protocols: Vec<String>,
    description: String,
    kind: BackendKind,
    factory: BackendFactory,
}

impl BackendDescriptor {
    /// Describe a family that stores data itself.
    pub fn storage(
        protocols: &[&str],
        description: impl Into<String>,
        factory: BackendFactory,
    ) -> Self {
        Self::with_kind(protocols, description, BackendKind::Storage, factory)
    }

    /// Describe a family that wraps one inner backend.
    pub fn decorator(
        protocols: &[&str],
        description: impl Into<String>,
        factory: BackendFactory,
    ) -> Self {
        Self::with_kind(protocols, description, BackendKind::Decorator, factory)
    }

    fn with_kind(
        protocols: &[&str],
        description: impl Into<String>,
        kind: BackendKind,
        factory: BackendFactory,
    ) -> Self {
        Self {
            protocols: protocols.iter().map(|p| p.to_ascii_lowercase()).collect(),
            description: description.into(),
            kind,
            factory,
        }
    }

    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn is_decorator(&self) -> bool {
        self.kind == BackendKind::Decorator
    }

    /// Build a backend instance. Factory errors are returned unchanged.
    pub fn create(&self, request: BackendRequest<'_>) -> Result<Box<dyn Backend>> {
        (self.factory)(request)
    }

    fn validate(&self) -> Result<()> {
        if self.protocols.is_empty() {
            return Err(Error::InvalidInput(format!(
                "Backend '{}' declares no protocols",
                self.description
            )));
        }
        for protocol in &self.protocols {
            if !is_valid_scheme(protocol) {
                return Err(Error::InvalidInput(format!(
                    "Backend '{}' declares invalid protocol '{}'",
                    self.description, protocol
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("protocols", &self.protocols)
            .field("description", &self.description)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// URL scheme syntax: a letter followed by letters, digits, `+`, `-` or `.`.
fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Registry mapping URL schemes to backend families.
///
/// Populated through `&mut` before any resolution happens, then shared
/// read-only (usually behind an `Arc` inside a [`Resolver`]).
///
/// [`Resolver`]: crate::resolver::Resolver
#[derive(Debug, Default)]
pub struct BackendRegistry {
    by_scheme: HashMap<String, Arc<BackendDescriptor>>,
    order: Vec<Arc<BackendDescriptor>>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend family.
    ///
    /// # Preconditions
    /// - None of the descriptor's schemes is registered yet
    ///
    /// # Postconditions
    /// - Every scheme of the descriptor resolves to it
    ///
    /// # Errors
    /// - `InvalidInput` if the descriptor declares no or malformed schemes
    /// - `AlreadyExists` if a scheme is taken; the registry is unchanged
    pub fn register(&mut self, descriptor: BackendDescriptor) -> Result<()> {
        descriptor.validate()?;
        if let Some(taken) = descriptor
            .protocols()
            .iter()
            .find(|p| self.by_scheme.contains_key(p.as_str()))
        {
            return Err(Error::AlreadyExists(format!(
                "Scheme '{}' is already registered",
                taken
            )));
        }
        self.insert(descriptor);
        Ok(())
    }

    /// Register a backend family, shadowing earlier claims on its schemes.
    ///
    /// The most recently registered descriptor wins. Families left without
    /// any scheme are dropped from the registry.
    pub fn replace(&mut self, descriptor: BackendDescriptor) -> Result<()> {
        descriptor.validate()?;
        for protocol in descriptor.protocols() {
            if let Some(previous) = self.by_scheme.get(protocol) {
                warn!(
                    scheme = %protocol,
                    previous = %previous.description(),
                    replacement = %descriptor.description(),
                    "Replacing registered backend"
                );
            }
        }
        self.insert(descriptor);

        let by_scheme = &self.by_scheme;
        self.order
            .retain(|d| by_scheme.values().any(|live| Arc::ptr_eq(live, d)));
        Ok(())
    }

    fn insert(&mut self, descriptor: BackendDescriptor) {
        let descriptor = Arc::new(descriptor);
        for protocol in descriptor.protocols() {
            self.by_scheme.insert(protocol.clone(), Arc::clone(&descriptor));
        }
        self.order.push(descriptor);
    }

    /// Find the family serving `scheme` (case-insensitive).
    pub fn lookup(&self, scheme: &str) -> Option<&BackendDescriptor> {
        self.by_scheme
            .get(&scheme.to_ascii_lowercase())
            .map(|d| d.as_ref())
    }

    /// Check if a scheme is registered.
    pub fn has_scheme(&self, scheme: &str) -> bool {
        self.lookup(scheme).is_some()
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.by_scheme.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Registered families in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.order.iter().map(|d| d.as_ref())
    }
}

fn new_file_backend(request: BackendRequest<'_>) -> Result<Box<dyn Backend>> {
    let backend = FileBackend::new(request.url, request.config.lock.policy())?;
    Ok(Box::new(backend))
}

fn new_memory_backend(request: BackendRequest<'_>) -> Result<Box<dyn Backend>> {
    let backend = MemoryBackend::with_url(request.url, request.config.lock.policy());
    Ok(Box::new(backend))
}

fn new_crypt_backend(mut request: BackendRequest<'_>) -> Result<Box<dyn Backend>> {
    let passphrase = request.config.crypt.passphrase.clone().ok_or_else(|| {
        Error::InvalidRepositoryUrl(format!(
            "{} needs a passphrase (set {})",
            request.url, PASSPHRASE_ENV
        ))
    })?;
    let kdf = request.config.crypt.kdf.clone();
    let inner = request.take_inner()?;
    Ok(Box::new(CryptBackend::new(inner, passphrase, kdf)?))
}

/// Register the built-in `file`, `mem` and `crypt` families.
pub fn register_default_backends(registry: &mut BackendRegistry) -> Result<()> {
    registry.register(BackendDescriptor::storage(
        FileBackend::PROTOCOLS,
        FileBackend::DESCRIPTION,
        Box::new(new_file_backend),
    ))?;
    registry.register(BackendDescriptor::storage(
        MemoryBackend::PROTOCOLS,
        MemoryBackend::DESCRIPTION,
        Box::new(new_memory_backend),
    ))?;
    registry.register(BackendDescriptor::decorator(
        CryptBackend::PROTOCOLS,
        CryptBackend::DESCRIPTION,
        Box::new(new_crypt_backend),
    ))?;
    Ok(())
}

/// Create a registry with the built-in families.
pub fn create_default_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    register_default_backends(&mut registry).expect("Failed to register built-in backends");
    registry
}
