//! DID resolution.
//!
//! The validator only depends on the [`IdentityDirectory`] trait. A caching
//! decorator and an in-memory directory live here; [`PlcDirectory`] resolves
//! against a PLC directory host over HTTP.

use crate::domain::crypto::PublicKey;
use crate::foundation::{Did, RelayError, Result};
use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Resolved identity document, reduced to what the relay needs.
#[derive(Clone, Debug)]
pub struct Identity {
    pub did: Did,
    /// The account's atproto signing key, when the document carries one.
    pub signing_key: Option<PublicKey>,
    /// Service endpoints by id (e.g. `atproto_pds` -> URL).
    pub services: HashMap<String, String>,
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Resolves a DID. Fails with [`RelayError::DidNotFound`] when the DID
    /// does not exist and [`RelayError::Transient`] on infrastructure
    /// trouble.
    async fn lookup_did(&self, did: &Did) -> Result<Identity>;

    /// Cache-bypassing resolution, used to recover from stale documents
    /// after a key rotation.
    async fn refresh_did(&self, did: &Did) -> Result<Identity> {
        self.lookup_did(did).await
    }
}

/// Fixed directory for tests and closed deployments.
#[derive(Default)]
pub struct MemoryDirectory {
    identities: Mutex<HashMap<String, Identity>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: Identity) {
        self.identities
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(identity.did.as_str().to_string(), identity);
    }

    pub fn insert_key(&self, did: &Did, key: PublicKey) {
        self.insert(Identity { did: did.clone(), signing_key: Some(key), services: HashMap::new() });
    }

    pub fn remove(&self, did: &Did) {
        self.identities.lock().unwrap_or_else(|err| err.into_inner()).remove(did.as_str());
    }
}

#[async_trait]
impl IdentityDirectory for MemoryDirectory {
    async fn lookup_did(&self, did: &Did) -> Result<Identity> {
        self.identities
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .get(did.as_str())
            .cloned()
            .ok_or_else(|| RelayError::DidNotFound(did.to_string()))
    }
}

/// Write-through LRU over another directory. Negative caching is optional:
/// with signature-not-found tolerance enabled, negative entries could
/// suppress re-resolution after a key rotation, so callers opt in only when
/// unresolved DIDs are hard errors.
pub struct CachedDirectory {
    inner: Arc<dyn IdentityDirectory>,
    cache: Mutex<LruCache<String, Identity>>,
    negative: Option<Mutex<LruCache<String, Instant>>>,
    negative_ttl: Duration,
}

impl CachedDirectory {
    pub fn new(inner: Arc<dyn IdentityDirectory>, capacity: usize, cache_not_found: bool) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero");
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            negative: cache_not_found.then(|| Mutex::new(LruCache::new(capacity))),
            negative_ttl: Duration::from_secs(300),
        }
    }
}

#[async_trait]
impl IdentityDirectory for CachedDirectory {
    async fn lookup_did(&self, did: &Did) -> Result<Identity> {
        if let Some(hit) = self.cache.lock().unwrap_or_else(|err| err.into_inner()).get(did.as_str()) {
            return Ok(hit.clone());
        }
        if let Some(negative) = &self.negative {
            let mut negative = negative.lock().unwrap_or_else(|err| err.into_inner());
            if let Some(at) = negative.get(did.as_str()) {
                if at.elapsed() < self.negative_ttl {
                    return Err(RelayError::DidNotFound(did.to_string()));
                }
                negative.pop(did.as_str());
            }
        }
        self.refresh_did(did).await
    }

    async fn refresh_did(&self, did: &Did) -> Result<Identity> {
        match self.inner.lookup_did(did).await {
            Ok(identity) => {
                self.cache
                    .lock()
                    .unwrap_or_else(|err| err.into_inner())
                    .put(did.as_str().to_string(), identity.clone());
                Ok(identity)
            }
            Err(err) => {
                if matches!(err, RelayError::DidNotFound(_)) {
                    if let Some(negative) = &self.negative {
                        negative
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .put(did.as_str().to_string(), Instant::now());
                    }
                }
                Err(err)
            }
        }
    }
}

/// HTTP resolution against a PLC directory host.
pub struct PlcDirectory {
    base_url: String,
    client: reqwest::Client,
}

impl PlcDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl IdentityDirectory for PlcDirectory {
    async fn lookup_did(&self, did: &Did) -> Result<Identity> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), did);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| RelayError::Transient(format!("plc fetch: {err}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RelayError::DidNotFound(did.to_string()));
        }
        if !response.status().is_success() {
            return Err(RelayError::Transient(format!("plc fetch: http {}", response.status())));
        }
        let doc: serde_json::Value =
            response.json().await.map_err(|err| RelayError::Transient(format!("plc body: {err}")))?;
        parse_did_document(did, &doc)
    }
}

/// Pulls the atproto signing key and service endpoints out of a DID document.
fn parse_did_document(did: &Did, doc: &serde_json::Value) -> Result<Identity> {
    let mut signing_key = None;
    if let Some(methods) = doc.get("verificationMethod").and_then(|v| v.as_array()) {
        for method in methods {
            let id = method.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            if !id.ends_with("#atproto") {
                continue;
            }
            if let Some(multibase) = method.get("publicKeyMultibase").and_then(|v| v.as_str()) {
                signing_key = Some(PublicKey::from_multibase(multibase)?);
                break;
            }
        }
    }
    let mut services = HashMap::new();
    if let Some(entries) = doc.get("service").and_then(|v| v.as_array()) {
        for entry in entries {
            let (Some(id), Some(endpoint)) = (
                entry.get("id").and_then(|v| v.as_str()),
                entry.get("serviceEndpoint").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            services.insert(id.trim_start_matches('#').to_string(), endpoint.to_string());
        }
    }
    Ok(Identity { did: did.clone(), signing_key, services })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::crypto::{KeyAlgo, PrivateKey};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDirectory {
        inner: MemoryDirectory,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl IdentityDirectory for CountingDirectory {
        async fn lookup_did(&self, did: &Did) -> Result<Identity> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup_did(did).await
        }
    }

    fn did() -> Did {
        Did::parse("did:plc:ewvi7nxzyoun6zhxrhs64oiz").expect("did")
    }

    #[tokio::test]
    async fn cached_directory_hits_inner_once() {
        let key = PrivateKey::generate(KeyAlgo::K256).public_key();
        let inner = CountingDirectory { inner: MemoryDirectory::new(), lookups: AtomicUsize::new(0) };
        inner.inner.insert_key(&did(), key);
        let inner = Arc::new(inner);
        let cached = CachedDirectory::new(inner.clone(), 16, false);

        cached.lookup_did(&did()).await.expect("first lookup");
        cached.lookup_did(&did()).await.expect("second lookup");
        assert_eq!(inner.lookups.load(Ordering::SeqCst), 1);

        // refresh bypasses the cache
        cached.refresh_did(&did()).await.expect("refresh");
        assert_eq!(inner.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn negative_caching_is_opt_in() {
        let inner = Arc::new(CountingDirectory { inner: MemoryDirectory::new(), lookups: AtomicUsize::new(0) });

        let uncached = CachedDirectory::new(inner.clone(), 16, false);
        assert!(uncached.lookup_did(&did()).await.is_err());
        assert!(uncached.lookup_did(&did()).await.is_err());
        assert_eq!(inner.lookups.load(Ordering::SeqCst), 2);

        let cached = CachedDirectory::new(inner.clone(), 16, true);
        assert!(cached.lookup_did(&did()).await.is_err());
        assert!(cached.lookup_did(&did()).await.is_err());
        // second miss served from the negative cache
        assert_eq!(inner.lookups.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn did_document_parsing() {
        let key = PrivateKey::generate(KeyAlgo::P256).public_key();
        let doc = serde_json::json!({
            "id": did().as_str(),
            "verificationMethod": [{
                "id": format!("{}#atproto", did()),
                "type": "Multikey",
                "publicKeyMultibase": key.multibase(),
            }],
            "service": [{
                "id": "#atproto_pds",
                "type": "AtprotoPersonalDataServer",
                "serviceEndpoint": "https://pds.example.com",
            }],
        });
        let identity = parse_did_document(&did(), &doc).expect("parse");
        assert_eq!(identity.signing_key, Some(key));
        assert_eq!(identity.services.get("atproto_pds").map(String::as_str), Some("https://pds.example.com"));

        let empty = parse_did_document(&did(), &serde_json::json!({})).expect("parse");
        assert!(empty.signing_key.is_none());
    }
}
