//! Cached, batched entity lookup.
//!
//! A [`Loader`] is the usual "get entity by id" service: a [`RequestCache`]
//! in front of a [`BatchingResolver`]. Hits are served from the cache;
//! concurrent misses on the same key join one computation; misses on
//! different keys are coalesced into one store call.

use std::fmt;

use crate::cache::{Fingerprint, RequestCache};
use crate::config::Settings;
use crate::error::{CacheError, LookupError};
use crate::resolver::{BatchingResolver, Lookup, Store};

type EntityCache<S> = RequestCache<
    Fingerprint<<S as Store>::Key>,
    <S as Store>::Entity,
    LookupError<<S as Store>::Key, <S as Store>::Error>,
>;

pub struct Loader<S: Store> {
    request: &'static str,
    resolver: BatchingResolver<S>,
    cache: EntityCache<S>,
}

impl<S: Store> Loader<S> {
    /// `request` names the lookup in cache fingerprints, e.g. `"user_by_id"`.
    pub fn new(request: &'static str, store: S, settings: &Settings) -> Self {
        Self {
            request,
            resolver: BatchingResolver::with_config(store, &settings.batch),
            cache: RequestCache::from_config(&settings.cache),
        }
    }

    /// Builds a loader from existing parts, e.g. a cache shared with a
    /// sweeper.
    pub fn from_parts(request: &'static str, resolver: BatchingResolver<S>, cache: EntityCache<S>) -> Self {
        Self { request, resolver, cache }
    }

    pub async fn get(&self, key: S::Key) -> Lookup<S> {
        let fingerprint = Fingerprint::new(self.request, key.clone());
        let resolver = self.resolver.clone();
        self.cache
            .get_or_compute(fingerprint, move || async move { resolver.submit(key).await })
            .await
            .map_err(|e| match e {
                CacheError::Compute(e) => e,
                CacheError::Defect(message) => LookupError::Defect(message),
            })
    }

    /// Drops the cached entity for `key`, e.g. after it was written.
    pub fn invalidate(&self, key: &S::Key) -> bool {
        self.cache.invalidate(&Fingerprint::new(self.request, key.clone()))
    }

    pub fn resolver(&self) -> &BatchingResolver<S> {
        &self.resolver
    }

    pub fn cache(&self) -> &EntityCache<S> {
        &self.cache
    }
}

impl<S: Store> Clone for Loader<S> {
    fn clone(&self) -> Self {
        Self { request: self.request, resolver: self.resolver.clone(), cache: self.cache.clone() }
    }
}

impl<S: Store> fmt::Debug for Loader<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("request", &self.request)
            .field("resolver", &self.resolver)
            .field("cache", &self.cache)
            .finish()
    }
}
