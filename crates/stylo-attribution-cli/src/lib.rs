//! `stylo` command surface.
//!
//! Each invocation plays one page load against a `SQLite`-backed browser
//! storage: campaign capture and analytics startup run first, then the
//! requested command. Tag calls go to a recording backend and are printed as
//! JSON so a run can be inspected or asserted on.
//!
//! Entry points:
//! - [`run_cli`] for a parsed command line.
//! - [`run_command`] for a command against any [`BrowserStorage`].

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Map, Value};
use stylo_attribution_core::analytics::{FB_PIXEL_ID_ENV, GA4_ID_ENV, GOOGLE_ADS_ID_ENV};
use stylo_attribution_core::{
    now_utc, parse_rfc3339_utc, startup, submit_form, utm, AnalyticsDispatcher, BrowserStorage,
    ContactRequest, FormData, PageContext, RecordingTagBackend, SecurityLog, SecurityReport,
    TagConfig, TagEvent, TagKind, UtmStore,
};
use stylo_attribution_store_sqlite::SqliteBrowserStorage;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "STYLO_LOG";

#[derive(Debug, Parser)]
#[command(name = "stylo")]
#[command(about = "Stylo landing-page attribution CLI")]
pub struct Cli {
    #[arg(long, default_value = "./stylo_attribution.sqlite3")]
    db: PathBuf,

    /// Browser tab the session scope belongs to.
    #[arg(long, default_value = "default")]
    session: String,

    /// JSON tag config; overrides the ID flags and environment.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, env = GA4_ID_ENV)]
    ga4_id: Option<String>,

    #[arg(long, env = FB_PIXEL_ID_ENV)]
    fb_pixel_id: Option<String>,

    #[arg(long, env = GOOGLE_ADS_ID_ENV)]
    google_ads_id: Option<String>,

    /// RFC3339 UTC clock override.
    #[arg(long)]
    now: Option<String>,

    /// Make loads of this tag fail, as a blocked script would
    /// (`google_tag` or `facebook_pixel`). Repeatable.
    #[arg(long = "block-tag")]
    block_tags: Vec<String>,

    #[command(flatten)]
    page: PageArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
pub struct PageArgs {
    #[arg(long, default_value = "https://stylo.example/")]
    url: String,
    #[arg(long, default_value = "")]
    referrer: String,
    #[arg(long, default_value = "Stylo Uniformes")]
    title: String,
    #[arg(long, default_value = "stylo-cli")]
    user_agent: String,
}

impl PageArgs {
    fn to_context(&self) -> PageContext {
        PageContext::new(self.url.clone())
            .with_referrer(self.referrer.clone())
            .with_title(self.title.clone())
            .with_user_agent(self.user_agent.clone())
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load the page and report what startup did.
    Visit,
    Consent {
        #[command(subcommand)]
        command: ConsentCommand,
    },
    Utm {
        #[command(subcommand)]
        command: UtmCommand,
    },
    Track {
        #[command(subcommand)]
        command: Box<TrackCommand>,
    },
    Form {
        #[command(subcommand)]
        command: FormCommand,
    },
    SecurityLog {
        #[command(subcommand)]
        command: SecurityLogCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConsentCommand {
    Show,
    Grant,
    Deny,
    Reset,
}

#[derive(Debug, Subcommand)]
pub enum UtmCommand {
    Show,
    Attribution,
    Paid,
    Clear,
}

#[derive(Debug, Subcommand)]
pub enum TrackCommand {
    PageView {
        #[arg(long)]
        page_title: Option<String>,
        #[arg(long)]
        page_location: Option<String>,
    },
    Event {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "{}")]
        params_json: String,
    },
    Cta {
        #[arg(long)]
        name: String,
        #[arg(long)]
        location: String,
    },
    Whatsapp {
        #[arg(long)]
        source: String,
    },
    Phone {
        #[arg(long)]
        source: String,
    },
    Email {
        #[arg(long)]
        source: String,
    },
    Form {
        #[arg(long, default_value = "contato")]
        form_name: String,
        /// `key=value`, repeatable.
        #[arg(long = "field")]
        fields: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum FormCommand {
    /// Run the contact form through the security gate.
    Submit {
        #[arg(long, default_value = "contato")]
        form_name: String,
        /// `key=value`, repeatable.
        #[arg(long = "field")]
        fields: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum SecurityLogCommand {
    Show {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    Clear,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}

/// What a command produced, before printing.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    Json(Value),
    SecurityTable(Vec<SecurityReport>),
}

/// Installs the stderr log subscriber; `STYLO_LOG` sets the filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes a parsed command line against the `SQLite` storage at `--db`.
///
/// # Errors
/// Returns an error when the store cannot be opened, the config or clock
/// flags are invalid, or a storage operation fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_tag_config(&cli)?;
    let now = match cli.now.as_deref() {
        Some(raw) => parse_rfc3339_utc(raw).map_err(|err| anyhow!(err.to_string()))?,
        None => now_utc(),
    };

    let backend = recording_backend(&cli.block_tags)?;

    let storage = SqliteBrowserStorage::open(&cli.db, &cli.session)?;
    storage.migrate()?;

    match run_command(cli.command, storage, backend, config, cli.page.to_context(), now)? {
        CommandOutput::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        CommandOutput::SecurityTable(entries) => print_security_table(&entries),
    }
    Ok(())
}

/// Plays one page load on `storage`, then runs `command`.
///
/// # Errors
/// Returns an error when arguments do not parse or a storage write fails.
pub fn run_command<S: BrowserStorage>(
    command: Command,
    storage: S,
    backend: RecordingTagBackend,
    config: TagConfig,
    page: PageContext,
    now: OffsetDateTime,
) -> Result<CommandOutput> {
    let page_load = startup(storage, backend, config, page, now);
    let mut dispatcher = page_load.dispatcher;

    let output = match command {
        Command::Visit => json!({
            "captured": page_load.captured,
            "utm_context": dispatcher.utm_context(),
            "consent": dispatcher.consent(),
            "enabled": dispatcher.is_enabled(),
            "initialize_error": page_load.initialize_error.map(|err| err.to_string()),
            "events": dispatcher.backend_mut().take_events(),
        }),
        Command::Consent { command } => run_consent(command, &mut dispatcher, now)?,
        Command::Utm { command } => run_utm(command, &mut dispatcher, now)?,
        Command::Track { command } => run_track(*command, &mut dispatcher)?,
        Command::Form { command } => run_form(command, &mut dispatcher, now)?,
        Command::SecurityLog { command } => {
            return run_security_log(command, dispatcher.storage_mut());
        }
    };

    Ok(CommandOutput::Json(output))
}

fn run_consent<S: BrowserStorage>(
    command: ConsentCommand,
    dispatcher: &mut AnalyticsDispatcher<S, RecordingTagBackend>,
    now: OffsetDateTime,
) -> Result<Value> {
    dispatcher.backend_mut().take_events();
    match command {
        ConsentCommand::Show => {}
        ConsentCommand::Grant => {
            dispatcher
                .set_consent(true, now)
                .context("failed to persist consent")?;
        }
        ConsentCommand::Deny => {
            dispatcher
                .set_consent(false, now)
                .context("failed to persist consent")?;
        }
        ConsentCommand::Reset => {
            dispatcher
                .reset_consent()
                .context("failed to reset consent")?;
        }
    }

    Ok(json!({
        "consent": dispatcher.consent(),
        "enabled": dispatcher.is_enabled(),
        "events": dispatcher.backend_mut().take_events(),
    }))
}

fn run_utm<S: BrowserStorage>(
    command: UtmCommand,
    dispatcher: &mut AnalyticsDispatcher<S, RecordingTagBackend>,
    now: OffsetDateTime,
) -> Result<Value> {
    let mut store = UtmStore::new(dispatcher.storage_mut());
    let output = match command {
        UtmCommand::Show => Value::Object(store.get(now).to_map()),
        UtmCommand::Attribution => json!({ "attribution": store.get_attribution_string(now) }),
        UtmCommand::Paid => json!({ "paid": store.is_paid_traffic(now) }),
        UtmCommand::Clear => {
            store.clear().context("failed to clear attribution")?;
            json!({ "cleared": true })
        }
    };
    Ok(output)
}

fn run_track<S: BrowserStorage>(
    command: TrackCommand,
    dispatcher: &mut AnalyticsDispatcher<S, RecordingTagBackend>,
) -> Result<Value> {
    dispatcher.backend_mut().take_events();
    let emitted = match command {
        TrackCommand::PageView {
            page_title,
            page_location,
        } => dispatcher.track_page_view(page_title.as_deref(), page_location.as_deref()),
        TrackCommand::Event { name, params_json } => {
            let params = parse_params_json(&params_json)?;
            dispatcher.track_event(&name, params)
        }
        TrackCommand::Cta { name, location } => dispatcher.track_cta_click(&name, &location),
        TrackCommand::Whatsapp { source } => dispatcher.track_whatsapp_click(&source),
        TrackCommand::Phone { source } => dispatcher.track_phone_click(&source),
        TrackCommand::Email { source } => dispatcher.track_email_click(&source),
        TrackCommand::Form { form_name, fields } => {
            let data = parse_fields(&fields)?;
            dispatcher.track_form_submission(&form_name, Some(&data))
        }
    };

    Ok(tracking_output(dispatcher, emitted))
}

fn run_form<S: BrowserStorage>(
    command: FormCommand,
    dispatcher: &mut AnalyticsDispatcher<S, RecordingTagBackend>,
    now: OffsetDateTime,
) -> Result<Value> {
    let FormCommand::Submit { form_name, fields } = command;
    let data = parse_fields(&fields)?;
    let page = dispatcher.page().clone();

    let mut contact = None;
    let outcome = submit_form(dispatcher.storage_mut(), &page, &data, now, |sanitized| {
        ContactRequest::from_form(sanitized).map(|request| {
            contact = Some(request);
        })
    });

    dispatcher.backend_mut().take_events();
    let emitted = match &contact {
        Some(request) if outcome.accepted => {
            dispatcher.track_form_submission(&form_name, Some(&lead_summary(request)))
        }
        _ => 0,
    };

    Ok(json!({
        "accepted": outcome.accepted,
        "errors": outcome.errors,
        "sanitized": outcome.sanitized,
        "contact": contact,
        "emitted": emitted,
        "events": dispatcher.backend_mut().take_events(),
    }))
}

fn run_security_log<S: BrowserStorage>(
    command: SecurityLogCommand,
    storage: &mut S,
) -> Result<CommandOutput> {
    let mut log = SecurityLog::new(storage);
    match command {
        SecurityLogCommand::Show { limit, format } => {
            let mut entries = log.entries();
            if let Some(limit) = limit {
                let skip = entries.len().saturating_sub(limit);
                entries.drain(..skip);
            }
            match format {
                OutputFormat::Json => Ok(CommandOutput::Json(serde_json::to_value(&entries)?)),
                OutputFormat::Table => Ok(CommandOutput::SecurityTable(entries)),
            }
        }
        SecurityLogCommand::Clear => {
            log.clear().context("failed to clear security log")?;
            Ok(CommandOutput::Json(json!({ "cleared": true })))
        }
    }
}

fn tracking_output<S: BrowserStorage>(
    dispatcher: &mut AnalyticsDispatcher<S, RecordingTagBackend>,
    emitted: usize,
) -> Value {
    let events: Vec<TagEvent> = dispatcher.backend_mut().take_events();
    json!({
        "enabled": dispatcher.is_enabled(),
        "emitted": emitted,
        "events": events,
        "attribution": utm::attribution_string(dispatcher.utm_context()),
    })
}

/// Lead fields forwarded to analytics; contact details stay out.
fn lead_summary(request: &ContactRequest) -> FormData {
    let mut summary = FormData::new();
    if let Some(produto) = &request.produto {
        summary.insert("produto".to_string(), Value::String(produto.clone()));
    }
    if let Some(quantidade) = &request.quantidade {
        summary.insert("quantidade".to_string(), Value::String(quantidade.clone()));
    }
    summary
}

fn load_tag_config(cli: &Cli) -> Result<TagConfig> {
    if let Some(path) = &cli.config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tag config at {}", path.display()))?;
        return TagConfig::from_json(&raw)
            .with_context(|| format!("invalid tag config at {}", path.display()));
    }

    TagConfig::from_lookup(|name| match name {
        GA4_ID_ENV => cli.ga4_id.clone(),
        FB_PIXEL_ID_ENV => cli.fb_pixel_id.clone(),
        GOOGLE_ADS_ID_ENV => cli.google_ads_id.clone(),
        _ => None,
    })
    .context("invalid tag IDs")
}

fn recording_backend(block_tags: &[String]) -> Result<RecordingTagBackend> {
    let mut backend = RecordingTagBackend::new();
    for name in block_tags {
        let tag = TagKind::parse(name.trim()).ok_or_else(|| {
            anyhow!("block-tag MUST be google_tag or facebook_pixel, got {name}")
        })?;
        backend = backend.failing_on(tag);
    }
    Ok(backend)
}

fn parse_fields(fields: &[String]) -> Result<FormData> {
    let mut data = FormData::new();
    for field in fields {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| anyhow!("field MUST use key=value form: {field}"))?;
        if key.trim().is_empty() {
            return Err(anyhow!("field key MUST be non-empty: {field}"));
        }
        data.insert(key.trim().to_string(), Value::String(value.to_string()));
    }
    Ok(data)
}

fn parse_params_json(raw: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(raw).context("params-json MUST be valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("params-json MUST be a JSON object")),
    }
}

fn print_security_table(entries: &[SecurityReport]) {
    println!("{:<15} {:<28} {:<40} context", "timestamp", "issue", "url");
    println!("{}", "-".repeat(110));
    for entry in entries {
        println!(
            "{:<15} {:<28} {:<40} {}",
            entry.timestamp,
            entry.issue,
            entry.url,
            entry.context.as_deref().unwrap_or("-")
        );
    }
}
