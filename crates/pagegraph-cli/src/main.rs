use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pagegraph_api::{ApiConfig, LoadRequest, NewMark, NewPage, PageEdit, PageGraphApi};
use pagegraph_core::{DomainRole, Facet, Id, MarkType, PageType, PairType, Template};
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "pg")]
#[command(about = "Page graph CLI")]
struct Cli {
    /// Overrides `db_path` from the config file.
    #[arg(long)]
    db: Option<PathBuf>,

    /// YAML file with store, lock and load settings.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Id {
        #[command(subcommand)]
        command: Box<IdCommand>,
    },
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Page {
        #[command(subcommand)]
        command: Box<PageCommand>,
    },
    Mark {
        #[command(subcommand)]
        command: Box<MarkCommand>,
    },
    Domain {
        #[command(subcommand)]
        command: Box<DomainCommand>,
    },
    Group {
        #[command(subcommand)]
        command: Box<GroupCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum IdCommand {
    Next,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Add(UserAddArgs),
}

#[derive(Debug, Args)]
struct UserAddArgs {
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
}

#[derive(Debug, Subcommand)]
enum PageCommand {
    Add(PageAddArgs),
    Edit(PageEditArgs),
    Load(PageLoadArgs),
    Pair(PagePairArgs),
    Lens(PageLensArgs),
    Answer(PageAnswerArgs),
    Link(PageLinkArgs),
    Lock(PageActorArgs),
    /// Soft-delete a page.
    Delete(PageActorArgs),
}

#[derive(Debug, Args)]
struct PageAddArgs {
    #[arg(long, value_parser = parse_id)]
    creator: Id,
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    text: String,
    #[arg(long, default_value = "")]
    clickbait: String,
    #[arg(long)]
    alias: Option<String>,
    #[arg(long = "type", value_enum, default_value_t = PageTypeArg::Wiki)]
    page_type: PageTypeArg,
    #[arg(long = "parent", value_parser = parse_id)]
    parents: Vec<Id>,
    #[arg(long = "domain", value_parser = parse_id)]
    domains: Vec<Id>,
    #[arg(long, value_parser = parse_id)]
    see_group: Option<Id>,
    #[arg(long, value_parser = parse_id)]
    edit_group: Option<Id>,
    /// Store the first edit as a private autosave.
    #[arg(long, default_value_t = false)]
    draft: bool,
    #[arg(long, default_value = "")]
    summary: String,
}

#[derive(Debug, Args)]
struct PageEditArgs {
    #[arg(long, value_parser = parse_id)]
    page: Id,
    #[arg(long, value_parser = parse_id)]
    creator: Id,
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    text: String,
    #[arg(long, default_value = "")]
    clickbait: String,
    #[arg(long, default_value = "")]
    summary: String,
    #[arg(long, default_value_t = false)]
    autosave: bool,
}

#[derive(Debug, Args)]
struct PageLoadArgs {
    #[arg(long = "id", value_parser = parse_id, required = true)]
    ids: Vec<Id>,
    #[arg(long, value_parser = parse_template, default_value = "title_plus")]
    template: Template,
    /// Extra facets requested on top of the template.
    #[arg(long = "facet", value_parser = parse_facet)]
    facets: Vec<Facet>,
    #[arg(long = "mark", value_parser = parse_id)]
    marks: Vec<Id>,
    /// Anonymous when omitted.
    #[arg(long)]
    viewer: Option<String>,
}

#[derive(Debug, Args)]
struct PagePairArgs {
    #[arg(long, value_parser = parse_id)]
    parent: Id,
    #[arg(long, value_parser = parse_id)]
    child: Id,
    #[arg(long = "type", value_enum, default_value_t = PairTypeArg::Parent)]
    pair_type: PairTypeArg,
    #[arg(long, value_parser = parse_id)]
    user: Id,
}

#[derive(Debug, Args)]
struct PageLensArgs {
    #[arg(long, value_parser = parse_id)]
    page: Id,
    #[arg(long, value_parser = parse_id)]
    lens: Id,
    #[arg(long, default_value_t = 0)]
    index: u32,
}

#[derive(Debug, Args)]
struct PageAnswerArgs {
    #[arg(long, value_parser = parse_id)]
    question: Id,
    #[arg(long, value_parser = parse_id)]
    answer: Id,
}

#[derive(Debug, Args)]
struct PageLinkArgs {
    #[arg(long, value_parser = parse_id)]
    from: Id,
    #[arg(long, value_parser = parse_id)]
    to: Id,
}

/// A page and the user acting on it.
#[derive(Debug, Args)]
struct PageActorArgs {
    #[arg(long, value_parser = parse_id)]
    page: Id,
    #[arg(long, value_parser = parse_id)]
    user: Id,
}

#[derive(Debug, Subcommand)]
enum MarkCommand {
    Add(MarkAddArgs),
}

#[derive(Debug, Args)]
struct MarkAddArgs {
    #[arg(long, value_parser = parse_id)]
    page: Id,
    #[arg(long, value_parser = parse_id)]
    creator: Id,
    #[arg(long = "type", value_enum, default_value_t = MarkTypeArg::Query)]
    mark_type: MarkTypeArg,
    #[arg(long, default_value = "")]
    anchor: String,
    #[arg(long, default_value = "")]
    text: String,
    #[arg(long, default_value_t = false)]
    submit: bool,
}

#[derive(Debug, Subcommand)]
enum DomainCommand {
    Add(DomainAddArgs),
    Role(DomainRoleArgs),
}

#[derive(Debug, Args)]
struct DomainAddArgs {
    #[arg(long, value_parser = parse_id)]
    page: Id,
    #[arg(long)]
    alias: String,
}

#[derive(Debug, Args)]
struct DomainRoleArgs {
    #[arg(long, value_parser = parse_id)]
    domain: Id,
    #[arg(long, value_parser = parse_id)]
    user: Id,
    /// `none` removes the membership.
    #[arg(long, value_enum)]
    role: DomainRoleArg,
}

#[derive(Debug, Subcommand)]
enum GroupCommand {
    AddMember(GroupAddMemberArgs),
}

#[derive(Debug, Args)]
struct GroupAddMemberArgs {
    #[arg(long, value_parser = parse_id)]
    group: Id,
    #[arg(long, value_parser = parse_id)]
    user: Id,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PageTypeArg {
    Wiki,
    Comment,
    Question,
    Group,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PairTypeArg {
    Parent,
    Tag,
    Prerequisite,
    Subject,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MarkTypeArg {
    Query,
    Typo,
    Confusion,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DomainRoleArg {
    None,
    Banned,
    Default,
    Trusted,
    Reviewer,
    Arbiter,
}

impl From<PageTypeArg> for PageType {
    fn from(value: PageTypeArg) -> Self {
        match value {
            PageTypeArg::Wiki => Self::Wiki,
            PageTypeArg::Comment => Self::Comment,
            PageTypeArg::Question => Self::Question,
            PageTypeArg::Group => Self::Group,
        }
    }
}

impl From<PairTypeArg> for PairType {
    fn from(value: PairTypeArg) -> Self {
        match value {
            PairTypeArg::Parent => Self::Parent,
            PairTypeArg::Tag => Self::Tag,
            PairTypeArg::Prerequisite => Self::Prerequisite,
            PairTypeArg::Subject => Self::Subject,
        }
    }
}

impl From<MarkTypeArg> for MarkType {
    fn from(value: MarkTypeArg) -> Self {
        match value {
            MarkTypeArg::Query => Self::Query,
            MarkTypeArg::Typo => Self::Typo,
            MarkTypeArg::Confusion => Self::Confusion,
        }
    }
}

impl From<DomainRoleArg> for DomainRole {
    fn from(value: DomainRoleArg) -> Self {
        match value {
            DomainRoleArg::None => Self::None,
            DomainRoleArg::Banned => Self::Banned,
            DomainRoleArg::Default => Self::Default,
            DomainRoleArg::Trusted => Self::Trusted,
            DomainRoleArg::Reviewer => Self::Reviewer,
            DomainRoleArg::Arbiter => Self::Arbiter,
        }
    }
}

fn parse_id(raw: &str) -> Result<Id, String> {
    Id::parse(raw).ok_or_else(|| format!("invalid page graph id `{raw}`"))
}

fn parse_template(raw: &str) -> Result<Template, String> {
    Template::parse(raw).map_err(|err| err.to_string())
}

fn parse_facet(raw: &str) -> Result<Facet, String> {
    Facet::parse(raw).ok_or_else(|| format!("unknown facet `{raw}`"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn load_config(cli: &Cli) -> Result<ApiConfig> {
    let mut config = match cli.config.as_deref() {
        Some(path) => ApiConfig::from_yaml_path(path)?,
        None => ApiConfig::default(),
    };
    if let Some(db) = cli.db.clone() {
        config.db_path = db;
    }
    Ok(config)
}

/// Logs go to stderr so stdout stays a single JSON document.
fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .with_context(|| format!("invalid log filter `{default_filter}`"))?,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.log_filter)?;
    let api = PageGraphApi::new(config);
    tracing::debug!(command = cli.command.name(), "dispatching");
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Id { command } => run_id(*command, &api),
        Command::User { command } => run_user(*command, &api),
        Command::Page { command } => run_page(*command, &api),
        Command::Mark { command } => run_mark(*command, &api),
        Command::Domain { command } => run_domain(*command, &api),
        Command::Group { command } => run_group(*command, &api),
    }
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Db { .. } => "db",
            Self::Id { .. } => "id",
            Self::User { .. } => "user",
            Self::Page { .. } => "page",
            Self::Mark { .. } => "mark",
            Self::Domain { .. } => "domain",
            Self::Group { .. } => "group",
        }
    }
}

fn run_db(command: DbCommand, api: &PageGraphApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "status": "ok",
                "backup_path": args.out.display().to_string()
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let ok = report.is_ok();
            let mut value = serde_json::to_value(&report)?;
            if let Value::Object(object) = &mut value {
                object.insert("ok".to_string(), Value::Bool(ok));
            }
            emit_json(value)
        }
    }
}

fn run_id(command: IdCommand, api: &PageGraphApi) -> Result<()> {
    match command {
        IdCommand::Next => {
            let id = api.next_id()?;
            emit_json(serde_json::json!({ "id": id }))
        }
    }
}

fn run_user(command: UserCommand, api: &PageGraphApi) -> Result<()> {
    match command {
        UserCommand::Add(args) => {
            let user_id = api.create_user(&args.first_name, &args.last_name)?;
            emit_json(serde_json::json!({ "user_id": user_id }))
        }
    }
}

fn run_page(command: PageCommand, api: &PageGraphApi) -> Result<()> {
    match command {
        PageCommand::Add(args) => run_page_add(args, api),
        PageCommand::Edit(args) => run_page_edit(args, api),
        PageCommand::Load(args) => run_page_load(args, api),
        PageCommand::Pair(args) => {
            let created = api.add_pair(&args.parent, &args.child, args.pair_type.into(), &args.user)?;
            emit_json(serde_json::json!({
                "parent_id": args.parent,
                "child_id": args.child,
                "pair_type": PairType::from(args.pair_type).as_str(),
                "created": created
            }))
        }
        PageCommand::Lens(args) => {
            api.add_lens(&args.page, &args.lens, args.index)?;
            emit_json(serde_json::json!({
                "page_id": args.page,
                "lens_id": args.lens,
                "lens_index": args.index
            }))
        }
        PageCommand::Answer(args) => {
            api.add_answer(&args.question, &args.answer)?;
            emit_json(serde_json::json!({
                "question_id": args.question,
                "answer_page_id": args.answer
            }))
        }
        PageCommand::Link(args) => {
            api.add_link(&args.from, &args.to)?;
            emit_json(serde_json::json!({
                "from_id": args.from,
                "to_id": args.to
            }))
        }
        PageCommand::Lock(args) => emit_json(serde_json::to_value(api.lock_page(&args.page, &args.user)?)?),
        PageCommand::Delete(args) => {
            api.delete_page(&args.page, &args.user)?;
            tracing::debug!(page_id = %args.page, "page deleted");
            emit_json(serde_json::json!({
                "page_id": args.page,
                "deleted": true
            }))
        }
    }
}

fn run_page_add(args: PageAddArgs, api: &PageGraphApi) -> Result<()> {
    let page = NewPage {
        page_type: args.page_type.into(),
        title: args.title,
        clickbait: args.clickbait,
        text: args.text,
        alias: args.alias,
        creator_id: args.creator,
        parent_ids: args.parents,
        domain_ids: args.domains,
        see_group_id: args.see_group,
        edit_group_id: args.edit_group,
        publish: !args.draft,
        edit_summary: args.summary,
    };
    let page_id = api.create_page(&page)?;
    emit_json(serde_json::json!({
        "page_id": page_id,
        "published": page.publish
    }))
}

fn run_page_edit(args: PageEditArgs, api: &PageGraphApi) -> Result<()> {
    let edit = PageEdit {
        creator_id: args.creator,
        title: args.title,
        clickbait: args.clickbait,
        text: args.text,
        edit_summary: args.summary,
        autosave: args.autosave,
    };
    let edit_num = api.save_edit(&args.page, &edit)?;
    emit_json(serde_json::json!({
        "page_id": args.page,
        "edit_num": edit_num,
        "autosave": edit.autosave
    }))
}

fn run_page_load(args: PageLoadArgs, api: &PageGraphApi) -> Result<()> {
    let mut request = LoadRequest::new(args.ids, args.template);
    request.extra = args.facets.into_iter().collect();
    request.mark_ids = args.marks;
    request.viewer_id = args.viewer.map(Id::new);
    let loaded = api.load(&request)?;
    emit_json(serde_json::to_value(&loaded)?)
}

fn run_mark(command: MarkCommand, api: &PageGraphApi) -> Result<()> {
    match command {
        MarkCommand::Add(args) => {
            let mark = NewMark {
                page_id: args.page,
                creator_id: args.creator,
                mark_type: args.mark_type.into(),
                anchor_context: args.anchor,
                text: args.text,
                is_submitted: args.submit,
            };
            let mark_id = api.add_mark(&mark)?;
            emit_json(serde_json::json!({ "mark_id": mark_id }))
        }
    }
}

fn run_domain(command: DomainCommand, api: &PageGraphApi) -> Result<()> {
    match command {
        DomainCommand::Add(args) => {
            let domain_id = api.create_domain(&args.page, &args.alias)?;
            emit_json(serde_json::json!({
                "domain_id": domain_id,
                "alias": args.alias
            }))
        }
        DomainCommand::Role(args) => {
            let role = DomainRole::from(args.role);
            api.set_domain_role(&args.domain, &args.user, role)?;
            emit_json(serde_json::json!({
                "domain_id": args.domain,
                "user_id": args.user,
                "role": role.as_str()
            }))
        }
    }
}

fn run_group(command: GroupCommand, api: &PageGraphApi) -> Result<()> {
    match command {
        GroupCommand::AddMember(args) => {
            api.add_group_member(&args.group, &args.user)?;
            emit_json(serde_json::json!({
                "group_id": args.group,
                "user_id": args.user
            }))
        }
    }
}
