//! Snapshot builder: read-and-assemble over the authoritative link source.
//!
//! The source is an external, read-only collaborator. It is not assumed to be
//! transactionally consistent with the rebuild queue.

pub mod postgres;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sheetcache_core::{InstrumentLink, SnapshotKey};

pub use postgres::PostgresLinkSource;

/// Source-of-truth read failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("link source unavailable: {0}")]
    Unavailable(String),
    #[error("link source query failed: {0}")]
    Query(String),
}

/// Read-only access to the instrument links of one sheet.
#[async_trait::async_trait]
pub trait InstrumentLinkSource: Send + Sync {
    async fn fetch_links(&self, key: SnapshotKey) -> Result<Vec<InstrumentLink>, SourceError>;
}

#[async_trait::async_trait]
impl<L> InstrumentLinkSource for Arc<L>
where
    L: InstrumentLinkSource + ?Sized,
{
    async fn fetch_links(&self, key: SnapshotKey) -> Result<Vec<InstrumentLink>, SourceError> {
        (**self).fetch_links(key).await
    }
}

/// Produces snapshot payload contents for a key.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder<L> {
    source: L,
}

impl<L: InstrumentLinkSource> SnapshotBuilder<L> {
    pub fn new(source: L) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &L {
        &self.source
    }

    /// Read the sheet's links and return them in deterministic order.
    pub async fn build(&self, key: SnapshotKey) -> Result<Vec<InstrumentLink>, SourceError> {
        let mut links = self.source.fetch_links(key).await?;
        canonicalize(&mut links);
        Ok(links)
    }
}

/// Stable ordering: tag, then id, then role; loop tags sorted and de-duplicated.
pub fn canonicalize(links: &mut [InstrumentLink]) {
    for link in links.iter_mut() {
        link.loop_tags.sort();
        link.loop_tags.dedup();
    }
    links.sort_by(|a, b| {
        a.instrument_tag
            .cmp(&b.instrument_tag)
            .then(a.instrument_id.cmp(&b.instrument_id))
            .then_with(|| a.link_role.cmp(&b.link_role))
    });
}

/// In-memory link source for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLinkSource {
    links: RwLock<HashMap<SnapshotKey, Vec<InstrumentLink>>>,
    failures: RwLock<HashMap<SnapshotKey, String>>,
}

impl InMemoryLinkSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_links(&self, key: SnapshotKey, links: Vec<InstrumentLink>) {
        if let Ok(mut map) = self.links.write() {
            map.insert(key, links);
        }
    }

    /// Make every subsequent read of `key` fail with `message`.
    pub fn set_failure(&self, key: SnapshotKey, message: impl Into<String>) {
        if let Ok(mut map) = self.failures.write() {
            map.insert(key, message.into());
        }
    }

    pub fn clear_failure(&self, key: SnapshotKey) {
        if let Ok(mut map) = self.failures.write() {
            map.remove(&key);
        }
    }
}

#[async_trait::async_trait]
impl InstrumentLinkSource for InMemoryLinkSource {
    async fn fetch_links(&self, key: SnapshotKey) -> Result<Vec<InstrumentLink>, SourceError> {
        let failures = self
            .failures
            .read()
            .map_err(|_| SourceError::Unavailable("lock poisoned".to_string()))?;
        if let Some(message) = failures.get(&key) {
            return Err(SourceError::Query(message.clone()));
        }

        let links = self
            .links
            .read()
            .map_err(|_| SourceError::Unavailable("lock poisoned".to_string()))?;
        Ok(links.get(&key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_orders_links_deterministically() {
        let source = InMemoryLinkSource::arc();
        let key = SnapshotKey::new(1, 5);
        source.set_links(
            key,
            vec![
                InstrumentLink::new(30, "TT-200").with_loop_tags(["L-2", "L-1", "L-2"]),
                InstrumentLink::new(20, "PT-101").with_role("secondary"),
                InstrumentLink::new(20, "PT-101").with_role("primary"),
                InstrumentLink::new(10, "PT-101"),
            ],
        );

        let links = SnapshotBuilder::new(source).build(key).await.unwrap();

        let order: Vec<_> = links
            .iter()
            .map(|l| (l.instrument_tag.as_str(), l.instrument_id, l.link_role.as_deref()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("PT-101", 10, None),
                ("PT-101", 20, Some("primary")),
                ("PT-101", 20, Some("secondary")),
                ("TT-200", 30, None),
            ]
        );
        assert_eq!(links[3].loop_tags, vec!["L-1".to_string(), "L-2".to_string()]);
    }

    #[tokio::test]
    async fn unknown_sheet_builds_empty() {
        let builder = SnapshotBuilder::new(InMemoryLinkSource::new());
        assert!(builder.build(SnapshotKey::new(9, 9)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn source_failures_propagate() {
        let source = InMemoryLinkSource::arc();
        let key = SnapshotKey::new(1, 5);
        source.set_failure(key, "relation does not exist");

        let builder = SnapshotBuilder::new(source.clone());
        let err = builder.build(key).await.unwrap_err();
        assert!(err.to_string().contains("relation does not exist"));

        source.clear_failure(key);
        assert!(builder.build(key).await.is_ok());
    }
}
