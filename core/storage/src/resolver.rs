//! Location resolution.
//!
//! Turns a user-supplied location string into a live backend:
//!
//! 1. Parse the string as a URL. Strings without a scheme are filesystem
//!    paths and become `file://` URLs.
//! 2. Look the scheme up in the registry.
//! 3. For a decorator, resolve the nested location first, then hand the
//!    inner backend to the decorator's factory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::backend::Backend;
use crate::config::StorageConfig;
use crate::registry::{create_default_registry, BackendDescriptor, BackendRegistry, BackendRequest};
use cairn_common::{Error, Result};

/// Deepest allowed decorator nesting.
pub const MAX_DECORATOR_DEPTH: usize = 4;

/// Resolves location strings against one registry.
#[derive(Debug, Clone)]
pub struct Resolver {
    registry: Arc<BackendRegistry>,
    config: StorageConfig,
}

impl Resolver {
    pub fn new(registry: Arc<BackendRegistry>, config: StorageConfig) -> Self {
        Self { registry, config }
    }

    /// A resolver over the built-in families.
    pub fn with_defaults(config: StorageConfig) -> Self {
        Self::new(Arc::new(create_default_registry()), config)
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Resolve `location` into a backend instance owned by the caller.
    ///
    /// # Errors
    /// - `InvalidUrl` if the location is neither a URL nor a usable path
    /// - `InvalidRepositoryUrl` if no family serves the scheme, or decorators
    ///   wrap themselves or nest too deep
    /// - Any error of the selected factory, unchanged
    pub fn resolve(&self, location: &str) -> Result<Box<dyn Backend>> {
        self.resolve_nested(location, 0, None)
    }

    fn resolve_nested(
        &self,
        location: &str,
        depth: usize,
        wrapper: Option<&BackendDescriptor>,
    ) -> Result<Box<dyn Backend>> {
        let location = location.trim();
        let url = parse_location(location)?;
        let descriptor = self.registry.lookup(url.scheme()).ok_or_else(|| {
            Error::InvalidRepositoryUrl(format!(
                "No backend registered for scheme '{}'",
                url.scheme()
            ))
        })?;

        if wrapper.is_some_and(|w| std::ptr::eq(w, descriptor)) {
            return Err(Error::InvalidRepositoryUrl(format!(
                "'{}' cannot wrap itself",
                url.scheme()
            )));
        }

        debug!(
            scheme = %url.scheme(),
            depth,
            decorator = descriptor.is_decorator(),
            "Resolving location"
        );

        let inner = if descriptor.is_decorator() {
            if depth >= MAX_DECORATOR_DEPTH {
                return Err(Error::InvalidRepositoryUrl(format!(
                    "More than {} nested decorators in {}",
                    MAX_DECORATOR_DEPTH, location
                )));
            }
            let nested = nested_location(location);
            Some(self.resolve_nested(nested, depth + 1, Some(descriptor))?)
        } else {
            None
        };

        descriptor.create(BackendRequest {
            url: &url,
            config: &self.config,
            inner,
        })
    }
}

/// The text after a decorator's `scheme:` prefix.
fn nested_location(location: &str) -> &str {
    location
        .split_once(':')
        .map(|(_, rest)| rest)
        .unwrap_or_default()
}

/// Parse a location string into a URL.
///
/// Strings with a scheme are taken as URLs. Anything else is a filesystem
/// path: relative paths are joined to the current directory and `.`/`..`
/// are removed lexically.
///
/// # Errors
/// - `InvalidUrl` for empty input, malformed URLs, and Windows drive paths
///   on other platforms
pub fn parse_location(location: &str) -> Result<Url> {
    let location = location.trim();
    if location.is_empty() {
        return Err(Error::InvalidUrl("Empty location".to_string()));
    }

    if is_drive_path(location) {
        #[cfg(windows)]
        return path_to_url(Path::new(location));
        #[cfg(not(windows))]
        return Err(Error::InvalidUrl(format!(
            "{}: drive paths are only supported on Windows",
            location
        )));
    }

    match Url::parse(location) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => path_to_url(Path::new(location)),
        Err(e) => Err(Error::InvalidUrl(format!("{}: {}", location, e))),
    }
}

/// `c:\...`, `C:/...` or a bare `c:`.
fn is_drive_path(location: &str) -> bool {
    let bytes = location.as_bytes();
    bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && matches!(bytes.get(2), None | Some(b'\\') | Some(b'/'))
}

fn path_to_url(path: &Path) -> Result<Url> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", path.display(), e)))?
            .join(path)
    };
    let normalized = normalize(&absolute);
    Url::from_file_path(&normalized)
        .map_err(|_| Error::InvalidUrl(format!("{} is not a usable path", path.display())))
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::CryptBackend;
    use crate::file::FileBackend;
    use crate::memory::MemoryBackend;
    use crate::registry::{BackendDescriptor, BackendFactory};
    use cairn_crypto::Passphrase;
    use proptest::prelude::*;

    fn resolver() -> Resolver {
        let mut config = StorageConfig::default();
        config.crypt.passphrase = Some(Passphrase::new("secret"));
        Resolver::with_defaults(config)
    }

    fn passthrough() -> BackendFactory {
        fn factory(mut request: BackendRequest<'_>) -> Result<Box<dyn Backend>> {
            request.take_inner()
        }
        Box::new(factory)
    }

    fn memory() -> BackendFactory {
        fn factory(_: BackendRequest<'_>) -> Result<Box<dyn Backend>> {
            Ok(Box::new(MemoryBackend::new()))
        }
        Box::new(factory)
    }

    #[test]
    fn test_bare_path_resolves_to_file() {
        let backend = resolver().resolve("/tmp/repo").unwrap();
        assert_eq!(backend.location(), "file:///tmp/repo");
        assert_eq!(backend.description(), FileBackend::DESCRIPTION);
    }

    #[test]
    fn test_bare_path_and_file_url_agree() {
        let resolver = resolver();
        let bare = resolver.resolve("/tmp/repo").unwrap();
        let url = resolver.resolve("file:///tmp/repo").unwrap();
        assert_eq!(bare.protocols(), url.protocols());
        assert_eq!(bare.location(), url.location());
    }

    #[test]
    fn test_relative_path_is_absolutized() {
        let url = parse_location("some/./dir/../repo").unwrap();
        let expected = std::env::current_dir().unwrap().join("some").join("repo");
        assert_eq!(url.to_file_path().unwrap(), expected);
    }

    #[test]
    fn test_parent_dirs_normalized() {
        let url = parse_location("/tmp/a/../b/./c").unwrap();
        assert_eq!(url.as_str(), "file:///tmp/b/c");
    }

    #[tokio::test]
    async fn test_mem_space_unknown() {
        let backend = resolver().resolve("mem:").unwrap();
        assert_eq!(backend.location(), "mem:");
        assert!(matches!(
            backend.available_space().await,
            Err(Error::AvailableSpaceUnknown(_))
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_drive_path_is_invalid() {
        assert!(matches!(
            resolver().resolve("c:\\foobar"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(parse_location("D:/data"), Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn test_empty_is_invalid() {
        assert!(matches!(resolver().resolve(""), Err(Error::InvalidUrl(_))));
        assert!(matches!(resolver().resolve("   "), Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn test_malformed_url_is_invalid() {
        assert!(matches!(
            parse_location("http://[::1"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_unknown_scheme() {
        assert!(matches!(
            resolver().resolve("s3://bucket/repo"),
            Err(Error::InvalidRepositoryUrl(_))
        ));
    }

    #[test]
    fn test_scheme_lookup_ignores_case() {
        let backend = resolver().resolve("MEM:").unwrap();
        assert_eq!(backend.description(), MemoryBackend::DESCRIPTION);
    }

    #[test]
    fn test_crypt_wraps_path() {
        let backend = resolver().resolve("crypt:/srv/repo").unwrap();
        assert_eq!(backend.location(), "crypt:file:///srv/repo");
        assert_eq!(backend.description(), CryptBackend::DESCRIPTION);
    }

    #[test]
    fn test_crypt_wraps_url_and_mem() {
        let resolver = resolver();
        assert_eq!(
            resolver.resolve("crypt:file:///srv/repo").unwrap().location(),
            "crypt:file:///srv/repo"
        );
        assert_eq!(resolver.resolve("crypt:mem:").unwrap().location(), "crypt:mem:");
    }

    #[test]
    fn test_crypt_inner_error_propagates() {
        let resolver = resolver();
        assert!(matches!(
            resolver.resolve("crypt:"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(
            resolver.resolve("crypt:s3://bucket"),
            Err(Error::InvalidRepositoryUrl(_))
        ));
    }

    #[test]
    fn test_crypt_without_passphrase() {
        let resolver = Resolver::with_defaults(StorageConfig::default());
        assert!(matches!(
            resolver.resolve("crypt:mem:"),
            Err(Error::InvalidRepositoryUrl(_))
        ));
    }

    #[test]
    fn test_self_wrap_rejected() {
        assert!(matches!(
            resolver().resolve("crypt:crypt:mem:"),
            Err(Error::InvalidRepositoryUrl(_))
        ));
    }

    #[test]
    fn test_decorator_depth_bound() {
        let mut registry = BackendRegistry::new();
        registry
            .register(BackendDescriptor::decorator(&["a"], "A", passthrough()))
            .unwrap();
        registry
            .register(BackendDescriptor::decorator(&["b"], "B", passthrough()))
            .unwrap();
        registry
            .register(BackendDescriptor::storage(&["mem"], "Memory", memory()))
            .unwrap();
        let resolver = Resolver::new(Arc::new(registry), StorageConfig::default());

        assert!(resolver.resolve("a:b:a:b:mem:").is_ok());
        assert!(matches!(
            resolver.resolve("a:b:a:b:a:mem:"),
            Err(Error::InvalidRepositoryUrl(_))
        ));
    }

    #[test]
    fn test_registries_are_isolated() {
        let mut only_mem = BackendRegistry::new();
        only_mem
            .register(BackendDescriptor::storage(&["mem"], "Memory", memory()))
            .unwrap();
        let isolated = Resolver::new(Arc::new(only_mem), StorageConfig::default());

        assert!(isolated.resolve("mem:").is_ok());
        assert!(matches!(
            isolated.resolve("/tmp/repo"),
            Err(Error::InvalidRepositoryUrl(_))
        ));
        assert!(resolver().resolve("/tmp/repo").is_ok());
    }

    proptest! {
        #[test]
        fn test_resolution_is_deterministic(path in "(/[a-z0-9]{1,8}){1,4}") {
            let resolver = resolver();
            let first = resolver.resolve(&path).unwrap().location();
            let second = resolver.resolve(&path).unwrap().location();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first, format!("file://{}", path));
        }
    }
}
