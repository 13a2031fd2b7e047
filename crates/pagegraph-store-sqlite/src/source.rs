use anyhow::{Context, Result};
use pagegraph_core::{
    ChangeLogRow, DomainMemberRow, DomainRole, DomainRow, EditRow, GraphSource, Id, LikeRow,
    MarkQuery, MarkRow, MarkType, MasteryRow, PageDomainRow, PageRow, PageType, RelationKind,
    RelationRow, SourceError, SourceResult, SubscriptionRow, SummaryRow, UserRow, VisibilityFlags,
    VisitRow, VoteRow,
};
use rusqlite::types::Type;
use rusqlite::{params_from_iter, Row};
use time::OffsetDateTime;

use crate::SqliteStore;

/// Where one relation kind lives: `from` is matched against the queried ids,
/// `to` names the related page.
struct Edge {
    table: &'static str,
    from: &'static str,
    to: &'static str,
    ordinal: &'static str,
    pair_type: Option<&'static str>,
    other_types: Option<&'static str>,
}

const fn pair_edge(from: &'static str, to: &'static str, pair_type: &'static str) -> Edge {
    Edge {
        table: "page_pairs",
        from,
        to,
        ordinal: "id",
        pair_type: Some(pair_type),
        other_types: None,
    }
}

fn edge(kind: RelationKind) -> Edge {
    match kind {
        RelationKind::Children => Edge {
            other_types: Some("f.page_type NOT IN ('comment', 'question')"),
            ..pair_edge("parent_id", "child_id", "parent")
        },
        RelationKind::Comments => Edge {
            other_types: Some("f.page_type = 'comment'"),
            ..pair_edge("parent_id", "child_id", "parent")
        },
        RelationKind::Questions => Edge {
            other_types: Some("f.page_type = 'question'"),
            ..pair_edge("parent_id", "child_id", "parent")
        },
        RelationKind::Parents => pair_edge("child_id", "parent_id", "parent"),
        RelationKind::Tags => pair_edge("child_id", "parent_id", "tag"),
        RelationKind::Related => pair_edge("parent_id", "child_id", "tag"),
        RelationKind::Prerequisites => pair_edge("child_id", "parent_id", "prerequisite"),
        RelationKind::PrerequisiteOf => pair_edge("parent_id", "child_id", "prerequisite"),
        RelationKind::Subjects => pair_edge("child_id", "parent_id", "subject"),
        RelationKind::Lenses => Edge {
            table: "lenses",
            from: "page_id",
            to: "lens_id",
            ordinal: "lens_index",
            pair_type: None,
            other_types: None,
        },
        RelationKind::Answers => Edge {
            table: "answers",
            from: "question_id",
            to: "answer_page_id",
            ordinal: "id",
            pair_type: None,
            other_types: None,
        },
        RelationKind::Links => Edge {
            table: "links",
            from: "from_id",
            to: "to_id",
            ordinal: "id",
            pair_type: None,
            other_types: None,
        },
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn id_params(ids: &[Id]) -> Vec<&str> {
    ids.iter().map(Id::as_str).collect()
}

/// Batch parameters followed by an optional user filter.
fn scoped_params<'a>(ids: &'a [Id], user_id: Option<&'a Id>) -> (Vec<&'a str>, &'static str) {
    let mut values = id_params(ids);
    match user_id {
        Some(user_id) => {
            values.push(user_id.as_str());
            (values, " AND user_id = ?")
        }
        None => (values, ""),
    }
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, message.into())
}

fn id_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Id> {
    Ok(Id::new(row.get::<_, String>(index)?))
}

fn opt_id_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<Id>> {
    Ok(row.get::<_, Option<String>>(index)?.map(Id::new))
}

fn time_at(row: &Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    OffsetDateTime::parse(&raw, &time::format_description::well_known::Rfc3339)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err)))
}

fn opt_time_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    match row.get::<_, Option<String>>(index)? {
        Some(_) => time_at(row, index).map(Some),
        None => Ok(None),
    }
}

fn page_type_at(row: &Row<'_>, index: usize) -> rusqlite::Result<PageType> {
    let raw: String = row.get(index)?;
    PageType::parse(&raw).ok_or_else(|| conversion_error(index, format!("unknown page type `{raw}`")))
}

fn mark_type_at(row: &Row<'_>, index: usize) -> rusqlite::Result<MarkType> {
    let raw: String = row.get(index)?;
    MarkType::parse(&raw).ok_or_else(|| conversion_error(index, format!("unknown mark type `{raw}`")))
}

fn role_at(row: &Row<'_>, index: usize) -> rusqlite::Result<DomainRole> {
    let raw: String = row.get(index)?;
    DomainRole::parse(&raw)
        .ok_or_else(|| conversion_error(index, format!("unknown domain role `{raw}`")))
}

fn ordinal_at(row: &Row<'_>, index: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(index)?;
    Ok(u32::try_from(raw).unwrap_or(u32::MAX))
}

/// Conversion failures mean a row the store holds cannot be represented;
/// everything else is the store itself failing.
fn source_error(err: &anyhow::Error) -> SourceError {
    let malformed = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::FromSqlConversionFailure(..))
        )
    });
    if malformed {
        SourceError::Malformed(format!("{err:#}"))
    } else {
        SourceError::Backend(format!("{err:#}"))
    }
}

impl SqliteStore {
    fn query_batch<T>(
        &self,
        what: &str,
        sql: &str,
        params: &[&str],
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let mut stmt =
            self.conn.prepare(sql).with_context(|| format!("failed to prepare {what} query"))?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), map)
            .with_context(|| format!("failed to run {what} query"))?;
        let rows = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to decode {what} rows"))?;
        tracing::trace!(query = what, batch = params.len(), rows = rows.len(), "batch query");
        Ok(rows)
    }

    fn load_relations(&self, kind: RelationKind, page_ids: &[Id]) -> Result<Vec<RelationRow>> {
        let edge = edge(kind);
        let mut conditions = Vec::new();
        if let Some(pair_type) = edge.pair_type {
            conditions.push(format!("e.pair_type = '{pair_type}'"));
        }
        if let Some(other_types) = edge.other_types {
            conditions.push(other_types.to_string());
        }
        conditions.push(format!("e.{} IN ({})", edge.from, placeholders(page_ids.len())));

        let sql = format!(
            "SELECT e.{from}, e.{to}, f.page_type, f.is_deleted, f.is_published,
                    f.see_group_id, f.creator_id, e.{ordinal}
             FROM {table} e
             JOIN page_flags f ON f.page_id = e.{to}
             WHERE {conditions}
             ORDER BY e.{from}, e.{ordinal}",
            from = edge.from,
            to = edge.to,
            ordinal = edge.ordinal,
            table = edge.table,
            conditions = conditions.join(" AND "),
        );

        self.query_batch(kind.as_str(), &sql, &id_params(page_ids), |row| {
            Ok(RelationRow {
                page_id: id_at(row, 0)?,
                other_id: id_at(row, 1)?,
                other_type: page_type_at(row, 2)?,
                other: VisibilityFlags {
                    is_deleted: row.get(3)?,
                    is_published: row.get(4)?,
                    see_group_id: opt_id_at(row, 5)?,
                    creator_id: opt_id_at(row, 6)?,
                },
                ordinal: ordinal_at(row, 7)?,
            })
        })
    }

    /// Base rows come from the live edit, or from the newest edit while the
    /// page has never been published.
    fn load_pages(&self, page_ids: &[Id], text_ids: &[Id]) -> Result<Vec<PageRow>> {
        let text_filter =
            if text_ids.is_empty() { "NULL".to_string() } else { placeholders(text_ids.len()) };
        let sql = format!(
            "SELECT pi.page_id, pi.page_type, p.title, p.clickbait, pi.alias, p.edit_num,
                    pi.created_at, pi.is_deleted, pi.current_edit > 0, pi.see_group_id,
                    pi.creator_id, p.is_autosave, p.is_snapshot, pi.edit_group_id,
                    pi.lock_owner_id, pi.locked_until,
                    CASE WHEN pi.page_id IN ({text_filter}) THEN p.text END
             FROM page_infos pi
             JOIN pages p ON p.page_id = pi.page_id
              AND p.edit_num = CASE WHEN pi.current_edit > 0 THEN pi.current_edit
                                    ELSE pi.max_edit END
             WHERE pi.page_id IN ({})",
            placeholders(page_ids.len())
        );
        let mut params = id_params(text_ids);
        params.extend(id_params(page_ids));

        self.query_batch("pages", &sql, &params, |row| {
            Ok(PageRow {
                id: id_at(row, 0)?,
                page_type: page_type_at(row, 1)?,
                title: row.get(2)?,
                clickbait: row.get(3)?,
                alias: row.get(4)?,
                edit_num: row.get(5)?,
                created_at: time_at(row, 6)?,
                flags: VisibilityFlags {
                    is_deleted: row.get(7)?,
                    is_published: row.get(8)?,
                    see_group_id: opt_id_at(row, 9)?,
                    creator_id: opt_id_at(row, 10)?,
                },
                is_autosave: row.get(11)?,
                is_snapshot: row.get(12)?,
                edit_group_id: opt_id_at(row, 13)?,
                lock_owner_id: opt_id_at(row, 14)?,
                locked_until: opt_time_at(row, 15)?,
                text: row.get(16)?,
            })
        })
    }

    fn load_marks(&self, query: MarkQuery, ids: &[Id]) -> Result<Vec<MarkRow>> {
        let column = match query {
            MarkQuery::OnPages => "page_id",
            MarkQuery::ResolvedTo => "resolved_page_id",
            MarkQuery::ById => "id",
        };
        let sql = format!(
            "SELECT id, page_id, creator_id, mark_type, anchor_context, text, created_at,
                    resolved_page_id, is_submitted
             FROM marks
             WHERE {column} IN ({})
             ORDER BY created_at, id",
            placeholders(ids.len())
        );
        self.query_batch("marks", &sql, &id_params(ids), |row| {
            Ok(MarkRow {
                id: id_at(row, 0)?,
                page_id: id_at(row, 1)?,
                creator_id: id_at(row, 2)?,
                mark_type: mark_type_at(row, 3)?,
                anchor_context: row.get(4)?,
                text: row.get(5)?,
                created_at: time_at(row, 6)?,
                resolved_page_id: opt_id_at(row, 7)?,
                is_submitted: row.get(8)?,
            })
        })
    }
}

impl GraphSource for SqliteStore {
    fn relations(&self, kind: RelationKind, page_ids: &[Id]) -> SourceResult<Vec<RelationRow>> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.load_relations(kind, page_ids).map_err(|err| source_error(&err))
    }

    fn pages(&self, page_ids: &[Id], text_ids: &[Id]) -> SourceResult<Vec<PageRow>> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.load_pages(page_ids, text_ids).map_err(|err| source_error(&err))
    }

    fn summaries(&self, page_ids: &[Id]) -> SourceResult<Vec<SummaryRow>> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT page_id, name, text FROM page_summaries
             WHERE page_id IN ({}) ORDER BY page_id, name",
            placeholders(page_ids.len())
        );
        self.query_batch("summaries", &sql, &id_params(page_ids), |row| {
            Ok(SummaryRow { page_id: id_at(row, 0)?, name: row.get(1)?, text: row.get(2)? })
        })
        .map_err(|err| source_error(&err))
    }

    fn marks(&self, query: MarkQuery, ids: &[Id]) -> SourceResult<Vec<MarkRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.load_marks(query, ids).map_err(|err| source_error(&err))
    }

    fn visits(&self, page_ids: &[Id], user_id: Option<&Id>) -> SourceResult<Vec<VisitRow>> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }
        let (params, user_filter) = scoped_params(page_ids, user_id);
        let sql = format!(
            "SELECT page_id, user_id, created_at FROM visits
             WHERE page_id IN ({}){user_filter} ORDER BY id",
            placeholders(page_ids.len())
        );
        self.query_batch("visits", &sql, &params, |row| {
            Ok(VisitRow { page_id: id_at(row, 0)?, user_id: id_at(row, 1)?, created_at: time_at(row, 2)? })
        })
        .map_err(|err| source_error(&err))
    }

    fn likes(&self, page_ids: &[Id]) -> SourceResult<Vec<LikeRow>> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT page_id, user_id, value FROM likes
             WHERE page_id IN ({}) ORDER BY updated_at, user_id",
            placeholders(page_ids.len())
        );
        self.query_batch("likes", &sql, &id_params(page_ids), |row| {
            Ok(LikeRow { page_id: id_at(row, 0)?, user_id: id_at(row, 1)?, value: row.get(2)? })
        })
        .map_err(|err| source_error(&err))
    }

    fn votes(&self, page_ids: &[Id]) -> SourceResult<Vec<VoteRow>> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT page_id, user_id, value, created_at FROM votes
             WHERE page_id IN ({}) ORDER BY id",
            placeholders(page_ids.len())
        );
        self.query_batch("votes", &sql, &id_params(page_ids), |row| {
            Ok(VoteRow {
                page_id: id_at(row, 0)?,
                user_id: id_at(row, 1)?,
                value: row.get(2)?,
                created_at: time_at(row, 3)?,
            })
        })
        .map_err(|err| source_error(&err))
    }

    fn subscriptions(
        &self,
        to_ids: &[Id],
        user_id: Option<&Id>,
    ) -> SourceResult<Vec<SubscriptionRow>> {
        if to_ids.is_empty() {
            return Ok(Vec::new());
        }
        let (params, user_filter) = scoped_params(to_ids, user_id);
        let sql = format!(
            "SELECT to_id, user_id FROM subscriptions
             WHERE to_id IN ({}){user_filter} ORDER BY to_id, user_id",
            placeholders(to_ids.len())
        );
        self.query_batch("subscriptions", &sql, &params, |row| {
            Ok(SubscriptionRow { to_id: id_at(row, 0)?, user_id: id_at(row, 1)? })
        })
        .map_err(|err| source_error(&err))
    }

    fn edits(&self, page_ids: &[Id]) -> SourceResult<Vec<EditRow>> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT page_id, edit_num, creator_id, created_at, edit_summary,
                    is_live_edit, is_autosave, is_snapshot
             FROM pages
             WHERE page_id IN ({}) ORDER BY page_id, edit_num",
            placeholders(page_ids.len())
        );
        self.query_batch("edits", &sql, &id_params(page_ids), |row| {
            Ok(EditRow {
                page_id: id_at(row, 0)?,
                edit_num: row.get(1)?,
                creator_id: id_at(row, 2)?,
                created_at: time_at(row, 3)?,
                edit_summary: row.get(4)?,
                is_live_edit: row.get(5)?,
                is_autosave: row.get(6)?,
                is_snapshot: row.get(7)?,
            })
        })
        .map_err(|err| source_error(&err))
    }

    fn change_logs(&self, page_ids: &[Id]) -> SourceResult<Vec<ChangeLogRow>> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT page_id, edit_num, user_id, change_type, aux_id, created_at FROM change_logs
             WHERE page_id IN ({}) ORDER BY page_id, id",
            placeholders(page_ids.len())
        );
        self.query_batch("change_logs", &sql, &id_params(page_ids), |row| {
            Ok(ChangeLogRow {
                page_id: id_at(row, 0)?,
                edit_num: row.get(1)?,
                user_id: id_at(row, 2)?,
                change_type: row.get(3)?,
                aux_id: opt_id_at(row, 4)?,
                created_at: time_at(row, 5)?,
            })
        })
        .map_err(|err| source_error(&err))
    }

    fn page_domains(&self, page_ids: &[Id]) -> SourceResult<Vec<PageDomainRow>> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT page_id, domain_id FROM page_domain_pairs
             WHERE page_id IN ({}) ORDER BY page_id, domain_id",
            placeholders(page_ids.len())
        );
        self.query_batch("page_domains", &sql, &id_params(page_ids), |row| {
            Ok(PageDomainRow { page_id: id_at(row, 0)?, domain_id: id_at(row, 1)? })
        })
        .map_err(|err| source_error(&err))
    }

    fn domains(&self, domain_ids: &[Id]) -> SourceResult<Vec<DomainRow>> {
        if domain_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, page_id, alias FROM domains WHERE id IN ({}) ORDER BY id",
            placeholders(domain_ids.len())
        );
        self.query_batch("domains", &sql, &id_params(domain_ids), |row| {
            Ok(DomainRow { id: id_at(row, 0)?, page_id: id_at(row, 1)?, alias: row.get(2)? })
        })
        .map_err(|err| source_error(&err))
    }

    fn domain_members(
        &self,
        domain_ids: &[Id],
        user_id: Option<&Id>,
    ) -> SourceResult<Vec<DomainMemberRow>> {
        if domain_ids.is_empty() {
            return Ok(Vec::new());
        }
        let (params, user_filter) = scoped_params(domain_ids, user_id);
        let sql = format!(
            "SELECT domain_id, user_id, role FROM domain_members
             WHERE domain_id IN ({}){user_filter} ORDER BY domain_id, user_id",
            placeholders(domain_ids.len())
        );
        self.query_batch("domain_members", &sql, &params, |row| {
            Ok(DomainMemberRow { domain_id: id_at(row, 0)?, user_id: id_at(row, 1)?, role: role_at(row, 2)? })
        })
        .map_err(|err| source_error(&err))
    }

    fn masteries(&self, page_ids: &[Id], user_id: Option<&Id>) -> SourceResult<Vec<MasteryRow>> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }
        let (params, user_filter) = scoped_params(page_ids, user_id);
        let sql = format!(
            "SELECT page_id, user_id, has, wants, updated_at FROM user_masteries
             WHERE page_id IN ({}){user_filter} ORDER BY page_id, user_id",
            placeholders(page_ids.len())
        );
        self.query_batch("masteries", &sql, &params, |row| {
            Ok(MasteryRow {
                page_id: id_at(row, 0)?,
                user_id: id_at(row, 1)?,
                has: row.get(2)?,
                wants: row.get(3)?,
                updated_at: time_at(row, 4)?,
            })
        })
        .map_err(|err| source_error(&err))
    }

    fn users(&self, user_ids: &[Id]) -> SourceResult<Vec<UserRow>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, first_name, last_name FROM users WHERE id IN ({}) ORDER BY id",
            placeholders(user_ids.len())
        );
        self.query_batch("users", &sql, &id_params(user_ids), |row| {
            Ok(UserRow { id: id_at(row, 0)?, first_name: row.get(1)?, last_name: row.get(2)? })
        })
        .map_err(|err| source_error(&err))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use anyhow::anyhow;
    use pagegraph_core::{
        run, LoadConfig, LoadContext, LoadError, PairType, Registry, Requirements, Stage, Template,
        Viewer,
    };

    use super::*;
    use crate::{NewMark, NewPage, PageEdit};

    fn migrated() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn wiki(creator_id: &Id, title: &str, parent_ids: &[Id]) -> NewPage {
        NewPage {
            title: title.to_string(),
            text: format!("{title} body"),
            creator_id: creator_id.clone(),
            parent_ids: parent_ids.to_vec(),
            publish: true,
            ..NewPage::default()
        }
    }

    // Test IDs: TSRC-001
    #[test]
    fn full_item_load_over_sqlite_registers_children_and_parent() -> Result<()> {
        let mut store = migrated()?;
        let author = store.create_user("Alexis", "Mercer")?;
        let parent = store.create_page(&wiki(&author, "Parent", &[]))?;
        let root = store.create_page(&wiki(&author, "Root", &[parent.clone()]))?;
        let mut children = Vec::new();
        for title in ["First", "Second", "Third"] {
            children.push(store.create_page(&wiki(&author, title, &[root.clone()]))?);
        }

        let ctx = LoadContext::new(Viewer::user(author.clone()));
        let loaded = run(
            &store,
            Registry::with_page(&root, Template::FullItem),
            &ctx,
            &LoadConfig::default(),
        )
        .map_err(|err| anyhow!("load failed: {err}"))?;
        let registry = &loaded.registry;

        let Some(page) = registry.page(&root) else {
            return Err(anyhow!("root page missing from registry"));
        };
        assert!(page.has_children);
        assert_eq!(page.child_ids, children);
        assert_eq!(page.parent_ids, vec![parent.clone()]);
        assert_eq!(page.text, "Root body");
        for child in &children {
            let Some(record) = registry.page(child) else {
                return Err(anyhow!("child {child} missing"));
            };
            assert_eq!(record.requirements, Requirements::TITLE_ONLY);
            assert!(record.text.is_empty());
        }
        assert!(registry.page(&parent).is_some());
        assert!(registry.user(&author).is_some_and(|user| user.first_name == "Alexis"));
        Ok(())
    }

    // Test IDs: TSRC-002
    #[test]
    fn relation_batch_is_one_query_for_many_pages() -> Result<()> {
        let mut store = migrated()?;
        let author = store.create_user("Alexis", "Mercer")?;
        let first = store.create_page(&wiki(&author, "First", &[]))?;
        let second = store.create_page(&wiki(&author, "Second", &[]))?;
        let child_a = store.create_page(&wiki(&author, "A", &[first.clone()]))?;
        let child_b = store.create_page(&wiki(&author, "B", &[second.clone()]))?;
        let comment = store.create_page(&NewPage {
            page_type: PageType::Comment,
            ..wiki(&author, "Nice", &[first.clone()])
        })?;

        let rows = store
            .relations(RelationKind::Children, &[first.clone(), second.clone()])
            .map_err(|err| anyhow!("{err}"))?;
        let pairs: Vec<(Id, Id)> =
            rows.into_iter().map(|row| (row.page_id, row.other_id)).collect();
        assert_eq!(pairs, vec![(first.clone(), child_a), (second, child_b)]);

        let comments = store
            .relations(RelationKind::Comments, &[first.clone()])
            .map_err(|err| anyhow!("{err}"))?;
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].other_id, comment);
        assert_eq!(comments[0].other_type, PageType::Comment);
        Ok(())
    }

    #[test]
    fn text_is_only_returned_for_text_ids() -> Result<()> {
        let mut store = migrated()?;
        let author = store.create_user("Alexis", "Mercer")?;
        let first = store.create_page(&wiki(&author, "First", &[]))?;
        let second = store.create_page(&wiki(&author, "Second", &[]))?;

        let rows = store
            .pages(&[first.clone(), second.clone()], &[second.clone()])
            .map_err(|err| anyhow!("{err}"))?;
        assert_eq!(rows.len(), 2);
        for row in rows {
            if row.id == second {
                assert_eq!(row.text.as_deref(), Some("Second body"));
            } else {
                assert_eq!(row.text, None);
            }
            assert!(row.flags.is_published);
        }
        Ok(())
    }

    #[test]
    fn unpublished_page_serves_its_newest_draft() -> Result<()> {
        let mut store = migrated()?;
        let author = store.create_user("Alexis", "Mercer")?;
        let page = store.create_page(&NewPage { publish: false, ..wiki(&author, "Draft", &[]) })?;
        store.save_edit(
            &page,
            &PageEdit {
                creator_id: author.clone(),
                title: "Draft v2".to_string(),
                autosave: true,
                ..PageEdit::default()
            },
        )?;

        let rows = store.pages(&[page.clone()], &[]).map_err(|err| anyhow!("{err}"))?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Draft v2");
        assert_eq!(rows[0].edit_num, 2);
        assert!(!rows[0].flags.is_published);
        assert!(rows[0].is_autosave);
        Ok(())
    }

    // Test IDs: TSRC-003
    #[test]
    fn unpublished_page_is_dropped_for_other_viewers() -> Result<()> {
        let mut store = migrated()?;
        let author = store.create_user("Alexis", "Mercer")?;
        let other = store.create_user("Jordan", "Reyes")?;
        let draft = store.create_page(&NewPage { publish: false, ..wiki(&author, "Draft", &[]) })?;

        let as_other = run(
            &store,
            Registry::with_page(&draft, Template::TitlePlus),
            &LoadContext::new(Viewer::user(other)),
            &LoadConfig::default(),
        )
        .map_err(|err| anyhow!("{err}"))?;
        assert!(as_other.registry.page(&draft).is_none());
        assert_eq!(as_other.report.dropped_page_ids, vec![draft.clone()]);

        let as_author = run(
            &store,
            Registry::with_page(&draft, Template::TitlePlus),
            &LoadContext::new(Viewer::user(author)),
            &LoadConfig::default(),
        )
        .map_err(|err| anyhow!("{err}"))?;
        assert!(as_author.registry.page(&draft).is_some());
        Ok(())
    }

    #[test]
    fn author_sees_own_autosave_as_draft() -> Result<()> {
        let mut store = migrated()?;
        let author = store.create_user("Alexis", "Mercer")?;
        let page = store.create_page(&wiki(&author, "Root", &[]))?;
        store.save_edit(
            &page,
            &PageEdit {
                creator_id: author.clone(),
                title: "Root draft".to_string(),
                autosave: true,
                ..PageEdit::default()
            },
        )?;

        let loaded = run(
            &store,
            Registry::with_page(&page, Template::EditItem),
            &LoadContext::new(Viewer::user(author.clone())),
            &LoadConfig::default(),
        )
        .map_err(|err| anyhow!("{err}"))?;
        let Some(record) = loaded.registry.page(&page) else {
            return Err(anyhow!("page missing"));
        };
        assert!(record.has_draft);
        assert_eq!(record.title, "Root");
        assert_eq!(record.edit_history.len(), 2);
        assert_eq!(record.creator_ids, vec![author]);
        Ok(())
    }

    #[test]
    fn satellite_rows_round_trip_through_sqlite() -> Result<()> {
        let mut store = migrated()?;
        let author = store.create_user("Alexis", "Mercer")?;
        let reader = store.create_user("Jordan", "Reyes")?;
        let page = store.create_page(&wiki(&author, "Root", &[]))?;
        let fix = store.create_page(&wiki(&author, "Fix", &[]))?;
        let landing = store.create_page(&wiki(&author, "Math", &[]))?;
        let domain = store.create_domain(&landing, "math")?;

        store.set_summary(&page, "Brief", "Short")?;
        store.record_visit(&reader, &page)?;
        store.set_like(&reader, &page, 1)?;
        store.add_vote(&reader, &page, 60)?;
        store.subscribe(&reader, &page)?;
        store.set_mastery(&reader, &page, true, false)?;
        store.set_domain_role(&domain, &reader, DomainRole::Trusted)?;
        let mark = store.add_mark(&NewMark {
            page_id: page.clone(),
            creator_id: reader.clone(),
            mark_type: MarkType::Confusion,
            text: "unclear".to_string(),
            ..NewMark::default()
        })?;
        store.resolve_mark(&mark, &fix)?;

        let check = |result: SourceResult<usize>, expected: usize| -> Result<()> {
            let count = result.map_err(|err| anyhow!("{err}"))?;
            assert_eq!(count, expected);
            Ok(())
        };
        let ids = [page.clone()];
        check(store.summaries(&ids).map(|rows| rows.len()), 1)?;
        check(store.visits(&ids, Some(&reader)).map(|rows| rows.len()), 1)?;
        check(store.visits(&ids, Some(&author)).map(|rows| rows.len()), 0)?;
        check(store.likes(&ids).map(|rows| rows.len()), 1)?;
        check(store.votes(&ids).map(|rows| rows.len()), 1)?;
        check(store.subscriptions(&ids, None).map(|rows| rows.len()), 1)?;
        check(store.masteries(&ids, Some(&reader)).map(|rows| rows.len()), 1)?;
        check(store.marks(MarkQuery::OnPages, &ids).map(|rows| rows.len()), 1)?;
        check(store.marks(MarkQuery::ResolvedTo, &[fix.clone()]).map(|rows| rows.len()), 1)?;
        check(store.change_logs(&ids).map(|rows| rows.len()), 1)?;
        check(store.domain_members(&[domain.clone()], None).map(|rows| rows.len()), 1)?;
        check(store.domains(&[domain]).map(|rows| rows.len()), 1)?;
        check(store.users(&[author, reader]).map(|rows| rows.len()), 2)?;
        Ok(())
    }

    #[test]
    fn tag_and_prerequisite_edges_read_from_the_right_side() -> Result<()> {
        let mut store = migrated()?;
        let author = store.create_user("Alexis", "Mercer")?;
        let tag = store.create_page(&wiki(&author, "Tag", &[]))?;
        let basics = store.create_page(&wiki(&author, "Basics", &[]))?;
        let page = store.create_page(&wiki(&author, "Page", &[]))?;
        store.add_pair(&tag, &page, PairType::Tag, &author)?;
        store.add_pair(&basics, &page, PairType::Prerequisite, &author)?;

        let tags = store.relations(RelationKind::Tags, &[page.clone()]).map_err(|err| anyhow!("{err}"))?;
        assert_eq!(tags.iter().map(|row| row.other_id.clone()).collect::<Vec<_>>(), vec![tag.clone()]);

        let related =
            store.relations(RelationKind::Related, &[tag]).map_err(|err| anyhow!("{err}"))?;
        assert_eq!(related.iter().map(|row| row.other_id.clone()).collect::<Vec<_>>(), vec![page.clone()]);

        let used = store
            .relations(RelationKind::PrerequisiteOf, &[basics.clone()])
            .map_err(|err| anyhow!("{err}"))?;
        assert_eq!(used.len(), 1);
        let prerequisites = store
            .relations(RelationKind::Prerequisites, &[page])
            .map_err(|err| anyhow!("{err}"))?;
        assert_eq!(prerequisites.iter().map(|row| row.other_id.clone()).collect::<Vec<_>>(), vec![basics]);
        Ok(())
    }

    // Test IDs: TSRC-004
    #[test]
    fn unmigrated_store_fails_the_load_with_stage_context() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        let result = run(
            &store,
            Registry::with_page(&Id::new("5k"), Template::FullItem),
            &LoadContext::new(Viewer::anonymous()),
            &LoadConfig::default(),
        );
        let Err(LoadError::Stage { stage, batch, first_id, source }) = result else {
            return Err(anyhow!("expected a stage failure"));
        };
        assert_eq!(stage, Stage::Children);
        assert_eq!(batch, 1);
        assert_eq!(first_id, "5k");
        assert!(matches!(source, SourceError::Backend(message) if message.contains("no such table")));
        Ok(())
    }

    // Test IDs: TSRC-005
    #[test]
    fn written_links_load_in_insertion_order() -> Result<()> {
        let mut store = migrated()?;
        let author = store.create_user("Alexis", "Mercer")?;
        let root = store.create_page(&wiki(&author, "Root", &[]))?;
        let second = store.create_page(&wiki(&author, "Second", &[]))?;
        let first = store.create_page(&wiki(&author, "First", &[]))?;
        store.add_link(&root, &second)?;
        store.add_link(&root, &first)?;
        store.add_link(&root, &second)?;

        let loaded = run(
            &store,
            Registry::with_page(&root, Requirements::LINKS),
            &LoadContext::new(Viewer::anonymous()),
            &LoadConfig::default(),
        )
        .map_err(|err| anyhow!("{err}"))?;
        let Some(page) = loaded.registry.page(&root) else {
            return Err(anyhow!("root page missing from registry"));
        };
        assert_eq!(page.link_ids, vec![second.clone(), first.clone()]);
        assert!(loaded.registry.page(&first).is_some());
        Ok(())
    }

    // Test IDs: TSRC-006
    #[test]
    fn deleted_page_drops_with_the_pages_found_through_it() -> Result<()> {
        let mut store = migrated()?;
        let author = store.create_user("Alexis", "Mercer")?;
        let parent = store.create_page(&wiki(&author, "Parent", &[]))?;
        let root = store.create_page(&wiki(&author, "Root", &[parent.clone()]))?;
        let child = store.create_page(&wiki(&author, "Child", &[root.clone()]))?;
        store.delete_page(&root, &author)?;

        let ctx = LoadContext::new(Viewer::user(author.clone()));
        let from_parent = run(
            &store,
            Registry::with_page(&parent, Requirements::CHILDREN),
            &ctx,
            &LoadConfig::default(),
        )
        .map_err(|err| anyhow!("{err}"))?;
        let Some(page) = from_parent.registry.page(&parent) else {
            return Err(anyhow!("parent page missing from registry"));
        };
        assert!(page.child_ids.is_empty());
        assert!(from_parent.registry.page(&root).is_none());

        let direct = run(&store, Registry::with_page(&root, Template::FullItem), &ctx, &LoadConfig::default())
            .map_err(|err| anyhow!("{err}"))?;
        assert!(direct.registry.pages().is_empty());
        assert_eq!(direct.report.dropped_page_ids, vec![root.clone()]);
        let mut orphaned = vec![parent, child];
        orphaned.sort();
        assert_eq!(direct.report.orphaned_page_ids, orphaned);
        Ok(())
    }

    #[test]
    fn undecodable_row_is_reported_as_malformed() -> Result<()> {
        let store = migrated()?;
        store.conn.execute(
            "INSERT INTO users(id, first_name, last_name, created_at) VALUES ('1', 'A', 'B', 'now')",
            [],
        )?;
        store.conn.execute(
            "INSERT INTO visits(page_id, user_id, created_at) VALUES ('2', '1', 'yesterday')",
            [],
        )?;
        let result = store.visits(&[Id::new("2")], None);
        assert!(matches!(result, Err(SourceError::Malformed(_))));
        Ok(())
    }
}
