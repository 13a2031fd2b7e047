use std::collections::BTreeSet;

use time::{Duration, OffsetDateTime};

use crate::memory::{page_row, MemorySource};
use crate::{
    run, DomainMemberRow, DomainRole, DomainRow, EditRow, Facet, Id, LoadConfig, LoadContext,
    LoadError, Loaded, MarkRow, MarkType, MasteryRow, PageType, PairType, Registry,
    Requirements, SourceError, Stage, Template, Viewer, VisitRow, VoteRow,
};

fn id(raw: &str) -> Id {
    Id::new(raw)
}

fn at(minutes: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::days(19_000) + Duration::minutes(minutes)
}

fn load(source: &MemorySource, registry: Registry, viewer: Viewer) -> Result<Loaded, LoadError> {
    let mut ctx = LoadContext::new(viewer);
    ctx.now = at(0);
    run(source, registry, &ctx, &LoadConfig::default())
}

/// `5k` with three children and one parent.
fn family() -> MemorySource {
    let mut source = MemorySource::new();
    source
        .add_wiki("5k", "Bayes")
        .add_wiki("6", "Priors")
        .add_wiki("7", "Likelihood")
        .add_wiki("8", "Posterior")
        .add_wiki("4", "Probability")
        .add_pair("5k", "6", PairType::Parent)
        .add_pair("5k", "7", PairType::Parent)
        .add_pair("5k", "8", PairType::Parent)
        .add_pair("4", "5k", PairType::Parent);
    source
}

fn mark(mark_id: &str, page: &str, creator: &str, submitted: bool) -> MarkRow {
    MarkRow {
        id: id(mark_id),
        page_id: id(page),
        creator_id: id(creator),
        mark_type: MarkType::Confusion,
        anchor_context: "the prior".to_string(),
        text: "unclear".to_string(),
        created_at: at(-10),
        resolved_page_id: None,
        is_submitted: submitted,
    }
}

fn edit(page: &str, edit_num: u32, creator: &str, autosave: bool) -> EditRow {
    EditRow {
        page_id: id(page),
        edit_num,
        creator_id: id(creator),
        created_at: at(i64::from(edit_num)),
        edit_summary: format!("edit {edit_num}"),
        is_live_edit: !autosave,
        is_autosave: autosave,
        is_snapshot: false,
    }
}

// Test IDs: TPIPE-001
#[test]
fn full_item_registers_children_and_parent() -> Result<(), LoadError> {
    let source = family();
    let loaded = load(
        &source,
        Registry::with_page(&id("5k"), Template::FullItem),
        Viewer::anonymous(),
    )?;
    let registry = &loaded.registry;

    let Some(root) = registry.page(&id("5k")) else {
        panic!("root page missing from registry");
    };
    assert_eq!(root.child_ids, vec![id("6"), id("7"), id("8")]);
    assert_eq!(root.parent_ids, vec![id("4")]);
    assert!(root.has_children);
    assert!(root.has_parents);
    assert_eq!(root.text, "Bayes body");

    for child in ["6", "7", "8"] {
        let Some(page) = registry.page(&id(child)) else {
            panic!("child {child} missing");
        };
        assert_eq!(page.requirements, Template::TitleOnly.requirements());
        assert!(!page.title.is_empty());
        assert!(page.text.is_empty());
    }
    assert!(registry.page(&id("4")).is_some());
    assert!(loaded.report.dropped_page_ids.is_empty());
    Ok(())
}

// Test IDs: TPIPE-002
#[test]
fn text_only_skips_child_loading() -> Result<(), LoadError> {
    let mut source = MemorySource::new();
    source
        .add_wiki("7q", "Quantiles")
        .add_wiki("8", "Median")
        .add_pair("7q", "8", PairType::Parent);
    let loaded = load(&source, Registry::with_page(&id("7q"), Requirements::TEXT), Viewer::anonymous())?;

    let Some(page) = loaded.registry.page(&id("7q")) else {
        panic!("7q missing");
    };
    assert!(page.child_ids.is_empty());
    assert_eq!(page.text, "Quantiles body");
    assert_eq!(source.calls_to("relations:children"), 0);
    assert_eq!(loaded.report.stage(Stage::Children).map(|r| r.selected), Some(0));
    assert_eq!(loaded.registry.pages().len(), 1);
    Ok(())
}

// Test IDs: TPIPE-003
#[test]
fn two_requests_for_one_page_share_a_record() -> Result<(), LoadError> {
    let mut source = MemorySource::new();
    let mut comment = page_row("3c", PageType::Comment, "");
    comment.text = Some("nice".to_string());
    source
        .add_wiki("2a", "Question")
        .add_page(comment)
        .add_wiki("3d", "Answer")
        .add_pair("2a", "3c", PairType::Parent)
        .add_answer("2a", "3d");

    let mut registry = Registry::new();
    registry.add_page(&id("2a"), Requirements::COMMENT_COUNT);
    registry.add_page(&id("2a"), Requirements::ANSWER_COUNT);
    let loaded = load(&source, registry, Viewer::anonymous())?;

    assert_eq!(source.calls_to("relations:comments"), 1);
    assert_eq!(source.calls_to("relations:answers"), 1);
    assert_eq!(loaded.registry.pages().len(), 1);
    let Some(page) = loaded.registry.page(&id("2a")) else {
        panic!("2a missing");
    };
    assert_eq!(page.comment_count, 1);
    assert_eq!(page.answer_count, 1);
    Ok(())
}

// Test IDs: TPIPE-004
#[test]
fn every_batch_touches_an_id_at_most_once() -> Result<(), LoadError> {
    let mut source = family();
    // 6 is reachable as a child, a tag and a related page.
    source
        .add_pair("6", "5k", PairType::Tag)
        .add_pair("5k", "6", PairType::Tag);
    let loaded = load(
        &source,
        Registry::with_page(&id("5k"), Template::FullItem),
        Viewer::user(id("3")),
    )?;

    let calls = source.calls();
    assert!(calls.len() <= Stage::ORDER.len());
    for call in &calls {
        let unique = call.ids.iter().collect::<BTreeSet<_>>();
        assert_eq!(unique.len(), call.ids.len(), "duplicate ids in {}", call.method);
    }
    assert_eq!(source.calls_to("pages"), 1);
    assert_eq!(
        loaded.registry.page(&id("6")).map(|page| page.requirements),
        Some(Requirements::TITLE_PLUS)
    );
    Ok(())
}

// Test IDs: TPIPE-005
#[test]
fn missing_and_invisible_pages_are_dropped() -> Result<(), LoadError> {
    let mut source = family();
    let mut draft = page_row("9d", PageType::Wiki, "Draft");
    draft.flags.is_published = false;
    draft.flags.creator_id = Some(id("44"));
    source.add_page(draft);

    let mut registry = Registry::with_page(&id("5k"), Template::FullItem);
    registry.add_page(&id("9z"), Requirements::TITLE_ONLY);
    registry.add_page(&id("9d"), Requirements::TEXT);
    let loaded = load(&source, registry, Viewer::user(id("3")))?;

    assert!(loaded.registry.page(&id("9z")).is_none());
    assert!(loaded.registry.page(&id("9d")).is_none());
    assert!(loaded.registry.page(&id("5k")).is_some());
    assert_eq!(loaded.report.dropped_page_ids, vec![id("9d"), id("9z")]);
    Ok(())
}

// Test IDs: TPIPE-009
#[test]
fn hidden_root_takes_its_marks_and_discoveries_along() -> Result<(), LoadError> {
    let mut source = family();
    let mut restricted = page_row("5k", PageType::Wiki, "Bayes");
    restricted.flags.see_group_id = Some(id("9g"));
    source
        .add_page(restricted)
        .add_user("3", "Ada", "Lovelace")
        .add_mark(mark("1m", "5k", "3", true));

    let loaded = load(&source, Registry::with_page(&id("5k"), Template::FullItem), Viewer::user(id("4")))?;
    let registry = &loaded.registry;

    assert!(registry.pages().is_empty(), "pages leaked: {:?}", registry.pages().keys());
    assert!(registry.mark(&id("1m")).is_none());
    assert!(registry.user(&id("3")).is_none());
    assert_eq!(loaded.report.dropped_page_ids, vec![id("5k")]);
    assert_eq!(loaded.report.orphaned_page_ids, vec![id("4"), id("6"), id("7"), id("8")]);
    Ok(())
}

#[test]
fn pages_reachable_from_another_root_survive_a_hidden_root() -> Result<(), LoadError> {
    let mut source = family();
    let mut restricted = page_row("5k", PageType::Wiki, "Bayes");
    restricted.flags.see_group_id = Some(id("9g"));
    let mut resolved = mark("2m", "7", "3", true);
    resolved.resolved_page_id = Some(id("5k"));
    source
        .add_page(restricted)
        .add_mark(mark("1m", "5k", "3", true))
        .add_mark(resolved);

    let mut registry = Registry::with_page(&id("5k"), Template::FullItem);
    registry.add_page(&id("7"), Requirements::MARKS);
    let loaded = load(&source, registry, Viewer::user(id("4")))?;
    let registry = &loaded.registry;

    assert!(registry.page(&id("7")).is_some());
    assert!(registry.mark(&id("1m")).is_none());
    let Some(kept) = registry.mark(&id("2m")) else {
        panic!("mark on the surviving page was removed");
    };
    assert_eq!(kept.resolved_page_id, None);
    assert!(registry.user(&id("3")).is_some());
    assert_eq!(loaded.report.orphaned_page_ids, vec![id("4"), id("6"), id("8")]);
    Ok(())
}

// Test IDs: TPIPE-006
#[test]
fn fields_stay_zero_unless_their_facet_was_required() -> Result<(), LoadError> {
    let mut source = family();
    source
        .add_summary("6", "short", "About priors")
        .add_summary("5k", "short", "About Bayes")
        .add_like("6", "3", 1)
        .add_like("5k", "3", 1)
        .add_subscription("3", "6")
        .add_edit(edit("6", 1, "3", false))
        .add_mark(mark("1m", "6", "3", true))
        .add_visit(VisitRow {
            page_id: id("6"),
            user_id: id("3"),
            created_at: at(-5),
        })
        .add_vote(VoteRow {
            page_id: id("6"),
            user_id: id("3"),
            value: 80,
            created_at: at(-5),
        })
        .add_user("3", "Ada", "Lovelace");
    let loaded = load(
        &source,
        Registry::with_page(&id("5k"), Template::FullItem),
        Viewer::user(id("3")),
    )?;

    for page in loaded.registry.pages().values() {
        let unrequested = page.observed_facets() - page.requirements;
        assert!(unrequested.is_empty(), "{} exposes {unrequested:?}", page.id);
    }
    let Some(child) = loaded.registry.page(&id("6")) else {
        panic!("child missing");
    };
    assert!(child.summaries.is_empty());
    assert_eq!(child.like_count, 0);
    assert!(child.votes.is_empty());
    let Some(root) = loaded.registry.page(&id("5k")) else {
        panic!("root missing");
    };
    assert_eq!(root.summaries.get("short").map(String::as_str), Some("About Bayes"));
    assert_eq!(root.like_count, 1);
    assert_eq!(root.my_like_value, 1);
    assert_eq!(root.liker_ids, vec![id("3")]);
    Ok(())
}

// Test IDs: TPIPE-007
#[test]
fn store_failure_aborts_with_stage_context() {
    let mut source = family();
    source.fail_on("relations:parents");
    let result = load(
        &source,
        Registry::with_page(&id("5k"), Template::FullItem),
        Viewer::anonymous(),
    );
    match result {
        Err(LoadError::Stage {
            stage,
            batch,
            first_id,
            source,
        }) => {
            assert_eq!(stage, Stage::Parents);
            assert_eq!(batch, 1);
            assert_eq!(first_id, "5k");
            assert_eq!(source, SourceError::Backend("relations:parents unavailable".to_string()));
        }
        other => panic!("expected a stage failure, got {other:?}"),
    }
    // Nothing after the failing stage ran.
    assert_eq!(source.calls_to("pages"), 0);
}

// Test IDs: TPIPE-008
#[test]
fn cancelled_load_returns_no_registry() {
    let source = family();
    let ctx = LoadContext::new(Viewer::anonymous());
    ctx.cancel.cancel();
    let result = run(
        &source,
        Registry::with_page(&id("5k"), Template::FullItem),
        &ctx,
        &LoadConfig::default(),
    );
    assert_eq!(result, Err(LoadError::Cancelled { stage: Stage::Children }));
    assert!(source.calls().is_empty());
}

#[test]
fn descendant_counts_cascade_to_children() -> Result<(), LoadError> {
    let mut source = family();
    source
        .add_wiki("9", "Conjugacy")
        .add_pair("6", "9", PairType::Parent);
    let loaded = load(&source, Registry::with_page(&id("5k"), Template::Outline), Viewer::anonymous())?;

    let Some(child) = loaded.registry.page(&id("6")) else {
        panic!("child missing");
    };
    assert!(child.requirements.has(Facet::SubpageCounts));
    assert!(child.has_children);
    assert_eq!(child.child_count, 1);
    assert!(child.child_ids.is_empty());
    assert!(loaded.registry.page(&id("9")).is_none());
    Ok(())
}

#[test]
fn lens_text_cascades_to_lenses() -> Result<(), LoadError> {
    let mut source = family();
    source.add_wiki("5l", "Bayes, visually").add_lens("5k", "5l", 0);

    let without = load(&source, Registry::with_page(&id("5k"), Requirements::LENSES), Viewer::anonymous())?;
    assert_eq!(without.registry.page(&id("5l")).map(|p| p.text.clone()), Some(String::new()));

    let with = load(
        &source,
        Registry::with_page(&id("5k"), Requirements::LENSES | Requirements::LENS_TEXT),
        Viewer::anonymous(),
    )?;
    assert_eq!(
        with.registry.page(&id("5l")).map(|p| p.text.clone()),
        Some("Bayes, visually body".to_string())
    );
    Ok(())
}

#[test]
fn relations_honor_the_visibility_predicate() -> Result<(), LoadError> {
    let mut source = family();
    let mut private = page_row("9p", PageType::Wiki, "Private");
    private.flags.see_group_id = Some(id("7g"));
    let mut deleted = page_row("9x", PageType::Wiki, "Deleted");
    deleted.flags.is_deleted = true;
    source
        .add_page(private)
        .add_page(deleted)
        .add_pair("5k", "9p", PairType::Parent)
        .add_pair("5k", "9x", PairType::Parent);

    let outsider = load(&source, Registry::with_page(&id("5k"), Requirements::CHILDREN), Viewer::user(id("3")))?;
    let children = outsider.registry.page(&id("5k")).map(|p| p.child_ids.clone());
    assert_eq!(children, Some(vec![id("6"), id("7"), id("8")]));

    let member = Viewer::user(id("3")).with_groups([id("7g")]);
    let insider = load(&source, Registry::with_page(&id("5k"), Requirements::CHILDREN), member)?;
    let children = insider.registry.page(&id("5k")).map(|p| p.child_ids.clone());
    assert_eq!(children, Some(vec![id("6"), id("7"), id("8"), id("9p")]));
    Ok(())
}

#[test]
fn comments_and_questions_are_not_children() -> Result<(), LoadError> {
    let mut source = family();
    source
        .add_page(page_row("3c", PageType::Comment, ""))
        .add_page(page_row("3q", PageType::Question, "Why?"))
        .add_pair("5k", "3c", PairType::Parent)
        .add_pair("5k", "3q", PairType::Parent);
    let loaded = load(&source, Registry::with_page(&id("5k"), Template::FullItem), Viewer::anonymous())?;

    let Some(root) = loaded.registry.page(&id("5k")) else {
        panic!("root missing");
    };
    assert_eq!(root.child_ids, vec![id("6"), id("7"), id("8")]);
    assert_eq!(root.comment_ids, vec![id("3c")]);
    assert_eq!(root.question_ids, vec![id("3q")]);
    assert_eq!(root.comment_count, 1);
    assert_eq!(
        loaded.registry.page(&id("3c")).map(|p| p.requirements),
        Some(Requirements::SUBPAGE)
    );
    Ok(())
}

#[test]
fn permissions_use_loaded_domain_roles() -> Result<(), LoadError> {
    let mut source = family();
    source
        .add_page_domain("5k", "1d")
        .add_domain(DomainRow {
            id: id("1d"),
            page_id: id("4"),
            alias: "stats".to_string(),
        })
        .add_member(DomainMemberRow {
            domain_id: id("1d"),
            user_id: id("3"),
            role: DomainRole::Reviewer,
        })
        .add_member(DomainMemberRow {
            domain_id: id("1d"),
            user_id: id("5"),
            role: DomainRole::Banned,
        });
    let loaded = load(&source, Registry::with_page(&id("5k"), Template::FullItem), Viewer::user(id("3")))?;

    let Some(domain) = loaded.registry.domain(&id("1d")) else {
        panic!("domain missing");
    };
    assert_eq!(domain.alias, "stats");
    assert_eq!(domain.viewer_role, DomainRole::Reviewer);
    let Some(permissions) = loaded.registry.page(&id("5k")).and_then(|p| p.permissions.clone()) else {
        panic!("permissions missing");
    };
    assert!(permissions.edit.allowed);
    assert!(permissions.delete.allowed);
    assert!(permissions.comment.allowed);
    Ok(())
}

#[test]
fn locked_page_denies_edit_through_the_pipeline() -> Result<(), LoadError> {
    let mut source = MemorySource::new();
    let mut locked = page_row("5k", PageType::Wiki, "Bayes");
    locked.lock_owner_id = Some(id("44"));
    locked.locked_until = Some(at(30));
    source.add_page(locked);
    let loaded = load(&source, Registry::with_page(&id("5k"), Template::EditItem), Viewer::user(id("3")))?;

    let Some(permissions) = loaded.registry.page(&id("5k")).and_then(|p| p.permissions.clone()) else {
        panic!("permissions missing");
    };
    assert!(!permissions.edit.allowed);
    assert_eq!(permissions.edit.reason, crate::permissions::REASON_LOCKED);
    assert_eq!(permissions.comment, permissions.edit);
    assert_eq!(permissions.delete, permissions.edit);
    Ok(())
}

#[test]
fn marks_respect_submission_and_register_their_authors() -> Result<(), LoadError> {
    let mut source = family();
    source
        .add_mark(mark("1m", "5k", "44", true))
        .add_mark(mark("2m", "5k", "44", false))
        .add_mark(mark("3m", "5k", "3", false))
        .add_user("44", "Grace", "Hopper")
        .add_user("3", "Ada", "Lovelace");
    let loaded = load(&source, Registry::with_page(&id("5k"), Template::FullItem), Viewer::user(id("3")))?;

    let mark_ids = loaded.registry.page(&id("5k")).map(|p| p.mark_ids.clone());
    assert_eq!(mark_ids, Some(vec![id("1m"), id("3m")]));
    assert!(loaded.registry.mark(&id("2m")).is_none());
    assert_eq!(
        loaded.registry.mark(&id("1m")).map(|m| m.mark_type),
        Some(MarkType::Confusion)
    );
    assert_eq!(
        loaded.registry.user(&id("44")).map(|u| u.display_name()),
        Some("Grace Hopper".to_string())
    );
    Ok(())
}

#[test]
fn caller_registered_marks_pull_in_their_page() -> Result<(), LoadError> {
    let mut source = family();
    source.add_mark(mark("1m", "7", "44", true));
    let mut registry = Registry::new();
    registry.add_mark(&id("1m"));
    registry.add_mark(&id("9m"));
    let loaded = load(&source, registry, Viewer::anonymous())?;

    assert_eq!(loaded.registry.mark(&id("1m")).map(|m| m.page_id.clone()), Some(id("7")));
    assert!(loaded.registry.mark(&id("9m")).is_none());
    assert_eq!(loaded.registry.page(&id("7")).map(|p| p.title.clone()), Some("Likelihood".to_string()));
    Ok(())
}

#[test]
fn viewer_state_loads_for_logged_in_viewers_only() -> Result<(), LoadError> {
    let mut source = family();
    source
        .add_edit(edit("5k", 1, "44", false))
        .add_edit(edit("5k", 2, "3", true))
        .add_subscription("3", "5k")
        .add_subscription("3", "44")
        .add_user("44", "Grace", "Hopper")
        .add_pair("9r", "5k", PairType::Prerequisite)
        .add_wiki("9r", "Algebra")
        .add_mastery(MasteryRow {
            page_id: id("9r"),
            user_id: id("3"),
            has: true,
            wants: false,
            updated_at: at(-60),
        })
        .add_visit(VisitRow {
            page_id: id("5k"),
            user_id: id("3"),
            created_at: at(-3),
        });
    let registry = Registry::with_page(
        &id("5k"),
        Requirements::EDIT_ITEM | Requirements::IS_SUBSCRIBED | Requirements::LAST_VISIT,
    );

    let logged_in = load(&source, registry.clone(), Viewer::user(id("3")))?;
    let Some(page) = logged_in.registry.page(&id("5k")) else {
        panic!("page missing");
    };
    assert!(page.has_draft);
    assert!(page.is_subscribed);
    assert_eq!(page.last_visit, Some(at(-3)));
    assert_eq!(page.prerequisite_ids, vec![id("9r")]);
    assert_eq!(page.creator_ids, vec![id("44")]);
    assert!(logged_in.registry.mastery(&id("9r")).is_some_and(|m| m.has));
    assert!(logged_in.registry.user(&id("44")).is_some_and(|u| u.is_subscribed));
    // The autosave is the viewer's own, so it shows in the history.
    assert_eq!(page.edit_history.len(), 2);

    source.reset_calls();
    let anonymous = load(&source, registry, Viewer::anonymous())?;
    let Some(page) = anonymous.registry.page(&id("5k")) else {
        panic!("page missing");
    };
    assert!(!page.has_draft);
    assert!(!page.is_subscribed);
    assert_eq!(page.edit_history.len(), 1);
    assert_eq!(source.calls_to("masteries"), 0);
    assert_eq!(source.calls_to("subscriptions"), 0);
    Ok(())
}
