use anyhow::{anyhow, bail, Context, Result};
use pagegraph_core::{DomainRole, Id, MarkType, PageType, PairType};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{allocate_id, now_rfc3339, parse_rfc3339, rfc3339, SqliteStore};

/// A page to create. With `publish` unset the first edit is stored as an
/// autosave and the page stays invisible to everyone but its creator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewPage {
    #[serde(default)]
    pub page_type: PageType,
    pub title: String,
    #[serde(default)]
    pub clickbait: String,
    #[serde(default)]
    pub text: String,
    /// Defaults to the allocated id.
    #[serde(default)]
    pub alias: Option<String>,
    pub creator_id: Id,
    #[serde(default)]
    pub parent_ids: Vec<Id>,
    #[serde(default)]
    pub domain_ids: Vec<Id>,
    #[serde(default)]
    pub see_group_id: Option<Id>,
    #[serde(default)]
    pub edit_group_id: Option<Id>,
    #[serde(default = "default_publish")]
    pub publish: bool,
    #[serde(default)]
    pub edit_summary: String,
}

fn default_publish() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageEdit {
    pub creator_id: Id,
    pub title: String,
    #[serde(default)]
    pub clickbait: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub edit_summary: String,
    /// Store as a private draft instead of a new live edit.
    #[serde(default)]
    pub autosave: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMark {
    pub page_id: Id,
    pub creator_id: Id,
    #[serde(default)]
    pub mark_type: MarkType,
    #[serde(default)]
    pub anchor_context: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_submitted: bool,
}

fn require_valid(id: &Id, what: &str) -> Result<()> {
    if id.is_valid() {
        Ok(())
    } else {
        Err(anyhow!("invalid {what} id `{id}`"))
    }
}

fn optional_id(id: Option<&Id>) -> Option<&str> {
    id.filter(|id| id.is_valid()).map(Id::as_str)
}

fn change_type_for_pair(pair_type: PairType) -> &'static str {
    match pair_type {
        PairType::Parent => "new_parent",
        PairType::Tag => "new_tag",
        PairType::Prerequisite => "new_prerequisite",
        PairType::Subject => "new_subject",
    }
}

fn page_edit_counts(conn: &Connection, page_id: &Id) -> Result<(u32, u32)> {
    conn.query_row(
        "SELECT current_edit, max_edit FROM page_infos WHERE page_id = ?1",
        params![page_id.as_str()],
        |row| Ok((row.get::<_, u32>(0)?, row.get::<_, u32>(1)?)),
    )
    .optional()
    .with_context(|| format!("failed to read edit counters for page {page_id}"))?
    .ok_or_else(|| anyhow!("page {page_id} does not exist"))
}

fn insert_pair(
    conn: &Connection,
    parent_id: &Id,
    child_id: &Id,
    pair_type: PairType,
    creator_id: &Id,
    now: &str,
) -> Result<bool> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO page_pairs(parent_id, child_id, pair_type, creator_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![parent_id.as_str(), child_id.as_str(), pair_type.as_str(), creator_id.as_str(), now],
        )
        .with_context(|| {
            format!("failed to insert {} pair {parent_id} -> {child_id}", pair_type.as_str())
        })?;
    Ok(inserted > 0)
}

fn insert_change_log(
    conn: &Connection,
    page_id: &Id,
    edit_num: u32,
    user_id: &Id,
    change_type: &str,
    aux_id: Option<&Id>,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO change_logs(page_id, edit_num, user_id, change_type, aux_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![page_id.as_str(), edit_num, user_id.as_str(), change_type, optional_id(aux_id), now],
    )
    .with_context(|| format!("failed to insert {change_type} change log for page {page_id}"))?;
    Ok(())
}

impl SqliteStore {
    /// Create a user with a freshly allocated id.
    ///
    /// # Errors
    /// Returns an error when allocation or the insert fails.
    pub fn create_user(&mut self, first_name: &str, last_name: &str) -> Result<Id> {
        self.with_transaction(|tx| {
            let user_id = allocate_id(tx)?;
            tx.execute(
                "INSERT INTO users(id, first_name, last_name, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![user_id.as_str(), first_name, last_name, now_rfc3339()?],
            )
            .context("failed to insert user")?;
            Ok(user_id)
        })
    }

    /// Create a page with its first edit, parent pairs, domain membership and
    /// change log, all in one transaction.
    ///
    /// # Errors
    /// Returns an error when the creator id is invalid, the title is empty, or
    /// any insert fails (for example a parent or domain that does not exist).
    pub fn create_page(&mut self, page: &NewPage) -> Result<Id> {
        require_valid(&page.creator_id, "creator")?;
        if page.title.trim().is_empty() {
            bail!("page title must not be empty");
        }

        self.with_transaction(|tx| {
            let page_id = allocate_id(tx)?;
            let now = now_rfc3339()?;
            let alias = page.alias.clone().unwrap_or_else(|| page_id.to_string());
            let current_edit: u32 = u32::from(page.publish);

            tx.execute(
                "INSERT INTO page_infos(
                    page_id, page_type, alias, current_edit, max_edit, creator_id, created_at,
                    see_group_id, edit_group_id
                ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8)",
                params![
                    page_id.as_str(),
                    page.page_type.as_str(),
                    alias,
                    current_edit,
                    page.creator_id.as_str(),
                    now,
                    optional_id(page.see_group_id.as_ref()),
                    optional_id(page.edit_group_id.as_ref()),
                ],
            )
            .context("failed to insert page info")?;

            tx.execute(
                "INSERT INTO pages(
                    page_id, edit_num, creator_id, created_at, title, clickbait, text,
                    edit_summary, is_live_edit, is_autosave
                ) VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    page_id.as_str(),
                    page.creator_id.as_str(),
                    now,
                    page.title,
                    page.clickbait,
                    page.text,
                    page.edit_summary,
                    page.publish,
                    !page.publish,
                ],
            )
            .context("failed to insert first page edit")?;

            insert_change_log(tx, &page_id, 1, &page.creator_id, "new_page", None, &now)?;

            for parent_id in &page.parent_ids {
                require_valid(parent_id, "parent")?;
                insert_pair(tx, parent_id, &page_id, PairType::Parent, &page.creator_id, &now)?;
                insert_change_log(
                    tx,
                    &page_id,
                    1,
                    &page.creator_id,
                    "new_parent",
                    Some(parent_id),
                    &now,
                )?;
            }

            for domain_id in &page.domain_ids {
                require_valid(domain_id, "domain")?;
                tx.execute(
                    "INSERT OR IGNORE INTO page_domain_pairs(page_id, domain_id) VALUES (?1, ?2)",
                    params![page_id.as_str(), domain_id.as_str()],
                )
                .with_context(|| format!("failed to add page {page_id} to domain {domain_id}"))?;
            }

            if page.page_type == PageType::Group {
                tx.execute(
                    "INSERT OR IGNORE INTO group_members(group_id, user_id, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![page_id.as_str(), page.creator_id.as_str(), now],
                )
                .context("failed to add group creator as member")?;
            }

            tracing::debug!(page_id = %page_id, page_type = page.page_type.as_str(), "created page");
            Ok(page_id)
        })
    }

    /// Append an edit to an existing page. A live edit becomes the page's
    /// current edit; an autosave only advances the edit counter.
    ///
    /// # Errors
    /// Returns an error when the page does not exist or the insert fails.
    pub fn save_edit(&mut self, page_id: &Id, edit: &PageEdit) -> Result<u32> {
        require_valid(&edit.creator_id, "creator")?;
        self.with_transaction(|tx| {
            let (_, max_edit) = page_edit_counts(tx, page_id)?;
            let edit_num = max_edit + 1;
            let now = now_rfc3339()?;

            tx.execute(
                "INSERT INTO pages(
                    page_id, edit_num, creator_id, created_at, title, clickbait, text,
                    edit_summary, is_live_edit, is_autosave
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    page_id.as_str(),
                    edit_num,
                    edit.creator_id.as_str(),
                    now,
                    edit.title,
                    edit.clickbait,
                    edit.text,
                    edit.edit_summary,
                    !edit.autosave,
                    edit.autosave,
                ],
            )
            .with_context(|| format!("failed to insert edit {edit_num} of page {page_id}"))?;

            if edit.autosave {
                tx.execute(
                    "UPDATE page_infos SET max_edit = ?2 WHERE page_id = ?1",
                    params![page_id.as_str(), edit_num],
                )
                .context("failed to advance edit counter")?;
            } else {
                tx.execute(
                    "UPDATE pages SET is_live_edit = 0 WHERE page_id = ?1 AND edit_num <> ?2",
                    params![page_id.as_str(), edit_num],
                )
                .context("failed to retire previous live edit")?;
                tx.execute(
                    "UPDATE page_infos SET current_edit = ?2, max_edit = ?2 WHERE page_id = ?1",
                    params![page_id.as_str(), edit_num],
                )
                .context("failed to publish edit")?;
                insert_change_log(tx, page_id, edit_num, &edit.creator_id, "new_edit", None, &now)?;
            }
            Ok(edit_num)
        })
    }

    /// Returns `false` when the pair already existed.
    ///
    /// # Errors
    /// Returns an error when either page does not exist or the insert fails.
    pub fn add_pair(
        &mut self,
        parent_id: &Id,
        child_id: &Id,
        pair_type: PairType,
        user_id: &Id,
    ) -> Result<bool> {
        require_valid(parent_id, "parent")?;
        require_valid(child_id, "child")?;
        self.with_transaction(|tx| {
            let now = now_rfc3339()?;
            let inserted = insert_pair(tx, parent_id, child_id, pair_type, user_id, &now)?;
            if inserted {
                let (current_edit, _) = page_edit_counts(tx, child_id)?;
                insert_change_log(
                    tx,
                    child_id,
                    current_edit,
                    user_id,
                    change_type_for_pair(pair_type),
                    Some(parent_id),
                    &now,
                )?;
            }
            Ok(inserted)
        })
    }

    /// Attach `lens_id` to `page_id` at position `lens_index`, moving it if
    /// already attached.
    ///
    /// # Errors
    /// Returns an error when either page does not exist.
    pub fn add_lens(&mut self, page_id: &Id, lens_id: &Id, lens_index: u32) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO lenses(page_id, lens_id, lens_index) VALUES (?1, ?2, ?3)
                 ON CONFLICT(page_id, lens_id) DO UPDATE SET lens_index = excluded.lens_index",
                params![page_id.as_str(), lens_id.as_str(), lens_index],
            )
            .with_context(|| format!("failed to attach lens {lens_id} to page {page_id}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when either page does not exist.
    pub fn add_answer(&mut self, question_id: &Id, answer_page_id: &Id) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO answers(question_id, answer_page_id) VALUES (?1, ?2)",
                params![question_id.as_str(), answer_page_id.as_str()],
            )
            .with_context(|| format!("failed to add answer {answer_page_id} to {question_id}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when either page does not exist.
    pub fn add_link(&mut self, from_id: &Id, to_id: &Id) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO links(from_id, to_id) VALUES (?1, ?2)",
                params![from_id.as_str(), to_id.as_str()],
            )
            .with_context(|| format!("failed to link {from_id} to {to_id}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the page does not exist.
    pub fn set_summary(&mut self, page_id: &Id, name: &str, text: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO page_summaries(page_id, name, text) VALUES (?1, ?2, ?3)
                 ON CONFLICT(page_id, name) DO UPDATE SET text = excluded.text",
                params![page_id.as_str(), name, text],
            )
            .with_context(|| format!("failed to set summary `{name}` on page {page_id}"))?;
        Ok(())
    }

    /// Create a domain rooted at `page_id`.
    ///
    /// # Errors
    /// Returns an error when the page does not exist or the alias is taken.
    pub fn create_domain(&mut self, page_id: &Id, alias: &str) -> Result<Id> {
        require_valid(page_id, "page")?;
        self.with_transaction(|tx| {
            let domain_id = allocate_id(tx)?;
            tx.execute(
                "INSERT INTO domains(id, page_id, alias, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![domain_id.as_str(), page_id.as_str(), alias, now_rfc3339()?],
            )
            .with_context(|| format!("failed to create domain `{alias}`"))?;
            Ok(domain_id)
        })
    }

    /// Set `user_id`'s role in a domain. [`DomainRole::None`] removes the
    /// membership.
    ///
    /// # Errors
    /// Returns an error when the domain or user does not exist.
    pub fn set_domain_role(&mut self, domain_id: &Id, user_id: &Id, role: DomainRole) -> Result<()> {
        if role == DomainRole::None {
            self.conn
                .execute(
                    "DELETE FROM domain_members WHERE domain_id = ?1 AND user_id = ?2",
                    params![domain_id.as_str(), user_id.as_str()],
                )
                .context("failed to remove domain member")?;
            return Ok(());
        }
        self.conn
            .execute(
                "INSERT INTO domain_members(domain_id, user_id, role, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(domain_id, user_id)
                 DO UPDATE SET role = excluded.role, updated_at = excluded.updated_at",
                params![domain_id.as_str(), user_id.as_str(), role.as_str(), now_rfc3339()?],
            )
            .with_context(|| format!("failed to set role of {user_id} in domain {domain_id}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the user does not exist.
    pub fn add_group_member(&mut self, group_id: &Id, user_id: &Id) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO group_members(group_id, user_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![group_id.as_str(), user_id.as_str(), now_rfc3339()?],
            )
            .with_context(|| format!("failed to add {user_id} to group {group_id}"))?;
        Ok(())
    }

    /// Groups `user_id` belongs to, used to build a viewer.
    ///
    /// # Errors
    /// Returns an error when the membership query fails.
    pub fn group_ids_for(&self, user_id: &Id) -> Result<Vec<Id>> {
        let mut stmt = self
            .conn
            .prepare("SELECT group_id FROM group_members WHERE user_id = ?1 ORDER BY group_id")
            .context("failed to prepare group membership query")?;
        let rows = stmt.query_map(params![user_id.as_str()], |row| row.get::<_, String>(0))?;

        let mut group_ids = Vec::new();
        for row in rows {
            group_ids.push(Id::new(row?));
        }
        Ok(group_ids)
    }

    /// Whether a user with this id exists.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn user_exists(&self, user_id: &Id) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                params![user_id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to look up user {user_id}"))?;
        Ok(exists == 1)
    }

    /// # Errors
    /// Returns an error when the page or creator does not exist.
    pub fn add_mark(&mut self, mark: &NewMark) -> Result<Id> {
        self.with_transaction(|tx| {
            let mark_id = allocate_id(tx)?;
            tx.execute(
                "INSERT INTO marks(
                    id, page_id, creator_id, mark_type, anchor_context, text, created_at, is_submitted
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    mark_id.as_str(),
                    mark.page_id.as_str(),
                    mark.creator_id.as_str(),
                    mark.mark_type.as_str(),
                    mark.anchor_context,
                    mark.text,
                    now_rfc3339()?,
                    mark.is_submitted,
                ],
            )
            .with_context(|| format!("failed to add mark on page {}", mark.page_id))?;
            Ok(mark_id)
        })
    }

    /// Record that `resolved_page_id` answers the mark.
    ///
    /// # Errors
    /// Returns an error when the mark does not exist.
    pub fn resolve_mark(&mut self, mark_id: &Id, resolved_page_id: &Id) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE marks SET resolved_page_id = ?2 WHERE id = ?1",
                params![mark_id.as_str(), resolved_page_id.as_str()],
            )
            .with_context(|| format!("failed to resolve mark {mark_id}"))?;
        if updated == 0 {
            bail!("mark {mark_id} does not exist");
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn record_visit(&mut self, user_id: &Id, page_id: &Id) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO visits(page_id, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![page_id.as_str(), user_id.as_str(), now_rfc3339()?],
            )
            .context("failed to record visit")?;
        Ok(())
    }

    /// Set a like (`1`), dislike (`-1`) or neutral (`0`) value.
    ///
    /// # Errors
    /// Returns an error when `value` is out of range or the upsert fails.
    pub fn set_like(&mut self, user_id: &Id, page_id: &Id, value: i32) -> Result<()> {
        if !(-1..=1).contains(&value) {
            bail!("like value {value} must be -1, 0 or 1");
        }
        self.conn
            .execute(
                "INSERT INTO likes(page_id, user_id, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(page_id, user_id)
                 DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![page_id.as_str(), user_id.as_str(), value, now_rfc3339()?],
            )
            .context("failed to set like")?;
        Ok(())
    }

    /// Append a probability vote in `0..=100`. Votes are a history; the latest
    /// per user counts.
    ///
    /// # Errors
    /// Returns an error when `value` is out of range or the insert fails.
    pub fn add_vote(&mut self, user_id: &Id, page_id: &Id, value: i32) -> Result<()> {
        if !(0..=100).contains(&value) {
            bail!("vote value {value} must be within 0..=100");
        }
        self.conn
            .execute(
                "INSERT INTO votes(page_id, user_id, value, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![page_id.as_str(), user_id.as_str(), value, now_rfc3339()?],
            )
            .context("failed to add vote")?;
        Ok(())
    }

    /// Subscribe `user_id` to a page or to another user.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn subscribe(&mut self, user_id: &Id, to_id: &Id) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO subscriptions(user_id, to_id, created_at) VALUES (?1, ?2, ?3)",
                params![user_id.as_str(), to_id.as_str(), now_rfc3339()?],
            )
            .context("failed to subscribe")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the upsert fails.
    pub fn set_mastery(&mut self, user_id: &Id, page_id: &Id, has: bool, wants: bool) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_masteries(user_id, page_id, has, wants, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id, page_id)
                 DO UPDATE SET has = excluded.has, wants = excluded.wants,
                               updated_at = excluded.updated_at",
                params![user_id.as_str(), page_id.as_str(), has, wants, now_rfc3339()?],
            )
            .context("failed to set mastery")?;
        Ok(())
    }

    /// Take or extend the edit lock on a page until `until`.
    ///
    /// # Errors
    /// Returns an error when the page does not exist or another user holds an
    /// unexpired lock.
    pub fn lock_page(&mut self, page_id: &Id, user_id: &Id, until: OffsetDateTime) -> Result<()> {
        require_valid(user_id, "user")?;
        self.with_transaction(|tx| {
            let lock = tx
                .query_row(
                    "SELECT lock_owner_id, locked_until FROM page_infos WHERE page_id = ?1",
                    params![page_id.as_str()],
                    |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()
                .with_context(|| format!("failed to read lock of page {page_id}"))?
                .ok_or_else(|| anyhow!("page {page_id} does not exist"))?;

            if let (Some(owner), Some(locked_until)) = lock {
                if owner != user_id.as_str()
                    && parse_rfc3339(&locked_until)? > OffsetDateTime::now_utc()
                {
                    bail!("page {page_id} is locked by {owner} until {locked_until}");
                }
            }

            tx.execute(
                "UPDATE page_infos SET lock_owner_id = ?2, locked_until = ?3 WHERE page_id = ?1",
                params![page_id.as_str(), user_id.as_str(), rfc3339(until)?],
            )
            .context("failed to lock page")?;
            Ok(())
        })
    }

    /// Mark a page deleted. Deleted pages stay in the store but are invisible
    /// to every viewer.
    ///
    /// # Errors
    /// Returns an error when the page does not exist.
    pub fn delete_page(&mut self, page_id: &Id, user_id: &Id) -> Result<()> {
        self.with_transaction(|tx| {
            let (current_edit, _) = page_edit_counts(tx, page_id)?;
            tx.execute(
                "UPDATE page_infos SET is_deleted = 1 WHERE page_id = ?1",
                params![page_id.as_str()],
            )
            .context("failed to delete page")?;
            insert_change_log(
                tx,
                page_id,
                current_edit,
                user_id,
                "deleted_page",
                None,
                &now_rfc3339()?,
            )
        })
    }
}
