//! In-memory blacklist cache.
//!
//! Readers match against an immutable [`PatternSet`] snapshot; the
//! snapshot is rebuilt from the store on startup, after every mutation
//! through this cache, and when the TTL has elapsed at read time.
//! Swapping the snapshot is the only write readers can observe, so a
//! reader always sees either the pre- or post-refresh state.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use logsink_core::blacklist::{BlacklistMatch, BlacklistPattern, PatternSet, PatternType};
use logsink_core::config::BlacklistConfig;
use logsink_core::{Result, SinkError};
use tracing::{debug, info};

use crate::images::ImageStore;
use crate::store::Store;

struct CacheState {
    set: Arc<PatternSet>,
    refreshed_at: Instant,
}

/// TTL-refreshed pattern cache with write-through mutations.
pub struct BlacklistCache {
    store: Store,
    images: ImageStore,
    config: BlacklistConfig,
    state: RwLock<CacheState>,
}

impl BlacklistCache {
    /// Builds the cache and loads the initial snapshot.
    pub fn new(store: Store, images: ImageStore, config: BlacklistConfig) -> Result<Self> {
        let set = Self::build_snapshot(&store)?;
        info!(patterns = set.len(), "blacklist cache initialized");
        Ok(Self {
            store,
            images,
            config,
            state: RwLock::new(CacheState {
                set: Arc::new(set),
                refreshed_at: Instant::now(),
            }),
        })
    }

    fn build_snapshot(store: &Store) -> Result<PatternSet> {
        let patterns = store.list_patterns(None)?;
        Ok(PatternSet::compile(&patterns))
    }

    /// Matches a message against the current snapshot, refreshing first
    /// when the TTL has elapsed. Returns `None` when the blacklist is
    /// disabled.
    pub fn check(&self, message: &str, application_id: &str) -> Result<Option<BlacklistMatch>> {
        if !self.config.enabled {
            return Ok(None);
        }
        Ok(self.snapshot()?.matches(message, application_id))
    }

    fn snapshot(&self) -> Result<Arc<PatternSet>> {
        {
            let state = self
                .state
                .read()
                .map_err(|_| SinkError::Internal("blacklist cache lock poisoned".into()))?;
            if state.refreshed_at.elapsed() < self.config.cache_ttl {
                return Ok(Arc::clone(&state.set));
            }
        }
        debug!("blacklist cache TTL elapsed, rebuilding");
        self.refresh()
    }

    /// Rebuilds the snapshot from the store and swaps it in.
    pub fn refresh(&self) -> Result<Arc<PatternSet>> {
        let set = Arc::new(Self::build_snapshot(&self.store)?);
        let mut state = self
            .state
            .write()
            .map_err(|_| SinkError::Internal("blacklist cache lock poisoned".into()))?;
        state.set = Arc::clone(&set);
        state.refreshed_at = Instant::now();
        Ok(set)
    }

    /// Number of patterns in the current snapshot.
    pub fn len(&self) -> Result<usize> {
        Ok(self.snapshot()?.len())
    }

    /// Adds a pattern, refreshes the snapshot, and applies auto-delete
    /// when configured. Returns the stored pattern and the number of
    /// issues closed by auto-delete.
    pub fn add_pattern(
        &self,
        pattern: &str,
        pattern_type: PatternType,
        application_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(BlacklistPattern, usize)> {
        let stored = self
            .store
            .insert_pattern(pattern, pattern_type, application_id, reason)?;
        self.refresh()?;
        let closed = self.auto_delete(&stored)?;
        Ok((stored, closed))
    }

    /// Updates a pattern, refreshes the snapshot, and applies
    /// auto-delete when configured.
    pub fn update_pattern(
        &self,
        id: i64,
        pattern: &str,
        pattern_type: PatternType,
        application_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(BlacklistPattern, usize)> {
        let stored = self
            .store
            .update_pattern(id, pattern, pattern_type, application_id, reason)?;
        self.refresh()?;
        let closed = self.auto_delete(&stored)?;
        Ok((stored, closed))
    }

    /// Removes a pattern and refreshes the snapshot.
    pub fn delete_pattern(&self, id: i64) -> Result<()> {
        self.store.delete_pattern(id)?;
        self.refresh()?;
        Ok(())
    }

    /// Removes every pattern and refreshes the snapshot.
    pub fn clear(&self) -> Result<usize> {
        let removed = self.store.clear_patterns()?;
        self.refresh()?;
        Ok(removed)
    }

    /// Closes existing issues of the pattern's application whose
    /// message matches a newly added or updated pattern. Global
    /// patterns are skipped: scanning every application on each global
    /// mutation is unbounded work.
    fn auto_delete(&self, stored: &BlacklistPattern) -> Result<usize> {
        if !self.config.auto_delete {
            return Ok(0);
        }
        let Some(app) = stored.application_id.as_deref() else {
            return Ok(0);
        };

        let single = PatternSet::compile(std::iter::once(stored));
        let mut closed = 0usize;
        for issue in self.store.list_issues(app)? {
            if issue.state == logsink_core::IssueState::Closed {
                continue;
            }
            if single.matches(&issue.message, app).is_none() {
                continue;
            }
            let (_, screenshots) = self.store.with_issue(app, issue.id, |issue| {
                issue.state = logsink_core::IssueState::Closed;
                Ok(std::mem::take(&mut issue.screenshots))
            })?;
            self.images.delete(&screenshots);
            closed += 1;
        }
        if closed > 0 {
            info!(
                pattern = %stored.pattern,
                application_id = %app,
                closed,
                "auto-deleted issues matching new blacklist pattern"
            );
        }
        Ok(closed)
    }
}
