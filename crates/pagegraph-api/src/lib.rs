//! Process-level facade over the page graph: opens the store from an explicit
//! [`ApiConfig`], resolves viewers and runs loads.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use pagegraph_core::{
    run, CancelToken, DomainRole, Id, LoadContext, Loaded, PairType, Registry, Requirements,
    Template, Viewer,
};
use pagegraph_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod config;

pub use config::ApiConfig;
pub use pagegraph_store_sqlite::{NewMark, NewPage, PageEdit};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Pages to load for one viewer. Every page gets `template` plus `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadRequest {
    pub page_ids: Vec<Id>,
    #[serde(default = "default_template")]
    pub template: Template,
    #[serde(default)]
    pub extra: Requirements,
    /// Marks to load alongside the pages.
    #[serde(default)]
    pub mark_ids: Vec<Id>,
    /// Anonymous when absent or not a valid id.
    #[serde(default)]
    pub viewer_id: Option<Id>,
}

fn default_template() -> Template {
    Template::TitlePlus
}

impl LoadRequest {
    #[must_use]
    pub fn new(page_ids: Vec<Id>, template: Template) -> Self {
        Self {
            page_ids,
            template,
            extra: Requirements::empty(),
            mark_ids: Vec::new(),
            viewer_id: None,
        }
    }

    #[must_use]
    pub fn for_viewer(mut self, viewer_id: Id) -> Self {
        self.viewer_id = Some(viewer_id);
        self
    }

    #[must_use]
    pub fn registry(&self) -> Registry {
        let requirements = self.template.requirements().merge(self.extra);
        let mut registry = Registry::new();
        for page_id in &self.page_ids {
            registry.add_page(page_id, requirements);
        }
        for mark_id in &self.mark_ids {
            registry.add_mark(mark_id);
        }
        registry
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageLock {
    pub page_id: Id,
    pub user_id: Id,
    #[serde(with = "time::serde::rfc3339")]
    pub locked_until: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct PageGraphApi {
    config: ApiConfig,
}

impl PageGraphApi {
    #[must_use]
    pub fn new(config: ApiConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open_with_busy_timeout(&self.config.db_path, self.config.busy_timeout())
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// `SQLite` health checks plus the page checks the loader depends on.
    ///
    /// # Errors
    /// Returns an error when any check query fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let store = self.open_store()?;
        store.backup_database(out_file)
    }

    /// Build the viewer for `viewer_id`, including its group memberships.
    ///
    /// # Errors
    /// Returns an error when a valid id names no user, or the lookup fails.
    pub fn viewer(&self, viewer_id: Option<&Id>) -> Result<Viewer> {
        let store = self.open_migrated()?;
        resolve_viewer(&store, viewer_id)
    }

    /// Load the pages named in `request` for its viewer.
    ///
    /// # Errors
    /// Returns an error when the viewer is unknown or the load fails.
    pub fn load(&self, request: &LoadRequest) -> Result<Loaded> {
        self.load_registry(request.registry(), request.viewer_id.as_ref(), &CancelToken::new())
    }

    /// Run the pipeline over a caller-built registry.
    ///
    /// # Errors
    /// Returns an error when the viewer is unknown, the store fails a batch, or
    /// `cancel` fires before the load completes.
    pub fn load_registry(
        &self,
        registry: Registry,
        viewer_id: Option<&Id>,
        cancel: &CancelToken,
    ) -> Result<Loaded> {
        let store = self.open_migrated()?;
        let viewer = resolve_viewer(&store, viewer_id)?;
        let ctx = LoadContext {
            cancel: cancel.clone(),
            ..LoadContext::new(viewer)
        };
        run(&store, registry, &ctx, &self.config.load).context("page graph load failed")
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn create_user(&self, first_name: &str, last_name: &str) -> Result<Id> {
        let mut store = self.open_migrated()?;
        store.create_user(first_name, last_name)
    }

    /// # Errors
    /// Returns an error when the creator is unknown or persistence fails.
    pub fn create_page(&self, page: &NewPage) -> Result<Id> {
        let mut store = self.open_migrated()?;
        if !store.user_exists(&page.creator_id)? {
            return Err(anyhow!("unknown creator {}", page.creator_id));
        }
        store.create_page(page)
    }

    /// # Errors
    /// Returns an error when the page does not exist or persistence fails.
    pub fn save_edit(&self, page_id: &Id, edit: &PageEdit) -> Result<u32> {
        let mut store = self.open_migrated()?;
        store.save_edit(page_id, edit)
    }

    /// Reserve the next id from the shared allocator.
    ///
    /// # Errors
    /// Returns an error when the allocation transaction fails.
    pub fn next_id(&self) -> Result<Id> {
        let mut store = self.open_migrated()?;
        store.reserve_id()
    }

    /// # Errors
    /// Returns an error when either page does not exist.
    pub fn add_pair(
        &self,
        parent_id: &Id,
        child_id: &Id,
        pair_type: PairType,
        user_id: &Id,
    ) -> Result<bool> {
        let mut store = self.open_migrated()?;
        store.add_pair(parent_id, child_id, pair_type, user_id)
    }

    /// # Errors
    /// Returns an error when either page does not exist.
    pub fn add_lens(&self, page_id: &Id, lens_id: &Id, lens_index: u32) -> Result<()> {
        let mut store = self.open_migrated()?;
        store.add_lens(page_id, lens_id, lens_index)
    }

    /// # Errors
    /// Returns an error when either page does not exist.
    pub fn add_answer(&self, question_id: &Id, answer_page_id: &Id) -> Result<()> {
        let mut store = self.open_migrated()?;
        store.add_answer(question_id, answer_page_id)
    }

    /// Record that `from_id`'s text links to `to_id`.
    ///
    /// # Errors
    /// Returns an error when either page does not exist.
    pub fn add_link(&self, from_id: &Id, to_id: &Id) -> Result<()> {
        let mut store = self.open_migrated()?;
        store.add_link(from_id, to_id)
    }

    /// Soft-delete a page. Loads drop it like a page that does not exist.
    ///
    /// # Errors
    /// Returns an error when the page does not exist.
    pub fn delete_page(&self, page_id: &Id, user_id: &Id) -> Result<()> {
        let mut store = self.open_migrated()?;
        store.delete_page(page_id, user_id)
    }

    /// # Errors
    /// Returns an error when the mark cannot be stored.
    pub fn add_mark(&self, mark: &NewMark) -> Result<Id> {
        let mut store = self.open_migrated()?;
        store.add_mark(mark)
    }

    /// Take the edit lock for the configured duration.
    ///
    /// # Errors
    /// Returns an error when another user holds the lock or the page does not exist.
    pub fn lock_page(&self, page_id: &Id, user_id: &Id) -> Result<PageLock> {
        let mut store = self.open_migrated()?;
        let locked_until = OffsetDateTime::now_utc() + self.config.edit_lock_duration();
        store.lock_page(page_id, user_id, locked_until)?;
        Ok(PageLock {
            page_id: page_id.clone(),
            user_id: user_id.clone(),
            locked_until,
        })
    }

    /// # Errors
    /// Returns an error when the landing page does not exist or the alias is taken.
    pub fn create_domain(&self, page_id: &Id, alias: &str) -> Result<Id> {
        let mut store = self.open_migrated()?;
        store.create_domain(page_id, alias)
    }

    /// # Errors
    /// Returns an error when the domain or user does not exist.
    pub fn set_domain_role(&self, domain_id: &Id, user_id: &Id, role: DomainRole) -> Result<()> {
        let mut store = self.open_migrated()?;
        store.set_domain_role(domain_id, user_id, role)
    }

    /// # Errors
    /// Returns an error when the user does not exist.
    pub fn add_group_member(&self, group_id: &Id, user_id: &Id) -> Result<()> {
        let mut store = self.open_migrated()?;
        store.add_group_member(group_id, user_id)
    }
}

fn resolve_viewer(store: &SqliteStore, viewer_id: Option<&Id>) -> Result<Viewer> {
    let Some(viewer_id) = viewer_id.filter(|id| id.is_valid()) else {
        return Ok(Viewer::anonymous());
    };
    if !store.user_exists(viewer_id)? {
        return Err(anyhow!("unknown viewer {viewer_id}"));
    }
    let group_ids = store.group_ids_for(viewer_id)?;
    tracing::debug!(viewer_id = %viewer_id, groups = group_ids.len(), "resolved viewer");
    Ok(Viewer::user(viewer_id.clone()).with_groups(group_ids))
}
