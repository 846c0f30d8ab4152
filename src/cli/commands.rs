use std::fmt::Write as _;
use std::io::{self, Read};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use strum::IntoEnumIterator;
use time::OffsetDateTime;

use crate::app::App;
use crate::config::AppConfig;
use crate::model::{EntityId, EntryKind, Field, FieldValue, Trip};
use crate::storage::{TripStore, TripSummary};
use crate::sync::transport::RemoteService;
use crate::sync::SyncEngine;

#[derive(Args, Debug, Clone, Default)]
pub struct TuiArgs {
    /// Trip to open (defaults to the first stored trip)
    #[arg(long)]
    pub trip: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct NewTripArgs {
    /// Title for the trip (prompted if omitted)
    #[arg()]
    pub title: Option<String>,
    /// Trip description. If omitted, reads from stdin when piped.
    #[arg(long)]
    pub description: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ShowArgs {
    /// Trip identifier
    pub trip: String,
    /// Print the trip as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    /// Trip identifier
    pub trip: String,
    /// Day, entry, todo or trip identifier
    pub entity: String,
    /// Field name: title, description, date, address, body or completed
    pub field: String,
    /// New value. Dates use YYYY-MM-DD ("none" clears), flags accept yes/no.
    pub value: String,
}

#[derive(Args, Debug, Clone)]
pub struct MoveArgs {
    /// Trip identifier
    pub trip: String,
    /// Parent whose children are reordered
    pub parent: String,
    /// Child to move
    pub item: String,
    /// Zero-based destination index
    pub index: usize,
}

pub fn run_tui(config: AppConfig, store: TripStore, args: TuiArgs) -> Result<()> {
    let trip_id = match args.trip {
        Some(id) => EntityId::from(id),
        None => match store.first_trip()? {
            Some(id) => id,
            None => store.seed_sample_trip().context("seeding a first trip")?,
        },
    };
    let mut app = App::new(Arc::new(config), store, &trip_id)?;
    app.run()
}

pub fn list_trips(store: &TripStore) -> Result<()> {
    let trips = store.list_trips().context("listing trips")?;
    print!("{}", format_trip_list(&trips));
    Ok(())
}

pub fn new_trip(store: &TripStore, args: NewTripArgs) -> Result<()> {
    let title = match args.title {
        Some(title) => title,
        None => prompt("Title")?,
    };
    let title = title.trim().to_owned();
    if title.is_empty() {
        bail!("trip title cannot be empty");
    }
    let description = match args.description {
        Some(description) => description,
        None => read_stdin()?.unwrap_or_default(),
    };

    let id = store.create_trip(&title).context("creating trip")?;
    let description = description.trim();
    if !description.is_empty() {
        store
            .update_field(&id, &[(Field::Description, FieldValue::text(description))])
            .context("saving trip description")?;
    }
    println!("Created trip '{title}' ({id})");
    Ok(())
}

pub fn seed(store: &TripStore) -> Result<()> {
    let id = store.seed_sample_trip()?;
    println!("Seeded sample trip ({id})");
    Ok(())
}

pub fn show(store: &TripStore, args: ShowArgs) -> Result<()> {
    let trip = store
        .fetch_trip(&EntityId::from(args.trip.as_str()))
        .with_context(|| format!("loading trip {}", args.trip))?;
    if args.json {
        let json = serde_json::to_string_pretty(&trip).context("serializing trip")?;
        println!("{json}");
    } else {
        print!("{}", render_tree(&trip));
    }
    Ok(())
}

pub fn edit(config: &AppConfig, store: TripStore, args: EditArgs) -> Result<()> {
    let field = Field::from_str(args.field.trim()).map_err(|_| {
        let known = Field::iter()
            .filter(|field| !field.is_structural())
            .map(|field| field.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        anyhow!("unknown field '{}' (expected one of: {known})", args.field)
    })?;
    let value = FieldValue::parse_for(field, &args.value)?;
    let entity = EntityId::from(args.entity);

    let mut engine = open_engine(config, store, &args.trip)?;
    if !engine.snapshot().contains(&entity) {
        bail!("no entity {entity} in trip {}", args.trip);
    }
    engine.edit_field(&entity, field, value)?;
    engine.flush_all();
    if engine.pending_writes() == 0 {
        println!("{field} of {entity} already has that value");
        return Ok(());
    }
    settle(&mut engine, config.sync.idle_timeout)?;
    println!("Updated {field} of {entity}");
    Ok(())
}

pub fn move_item(config: &AppConfig, store: TripStore, args: MoveArgs) -> Result<()> {
    let parent = EntityId::from(args.parent);
    let item = EntityId::from(args.item);

    let mut engine = open_engine(config, store, &args.trip)?;
    if !engine.move_sibling(&parent, &item, args.index)? {
        println!("{item} is already at position {}", args.index);
        return Ok(());
    }
    settle(&mut engine, config.sync.idle_timeout)?;
    let position = engine
        .canonical()
        .position_of(&item)
        .unwrap_or(args.index);
    println!("Moved {item} to position {position}");
    Ok(())
}

fn open_engine(config: &AppConfig, store: TripStore, trip: &str) -> Result<SyncEngine> {
    let remote: Arc<dyn RemoteService> = Arc::new(store);
    SyncEngine::connect(remote, &EntityId::from(trip), &config.sync)
        .with_context(|| format!("opening trip {trip}"))
}

/// Waits for every dispatched write and turns any rollback notice into an
/// error.
fn settle(engine: &mut SyncEngine, timeout: Duration) -> Result<()> {
    if !engine.wait_idle(timeout) {
        bail!(
            "the store did not answer within {}ms ({} request(s) outstanding)",
            timeout.as_millis(),
            engine.pending_writes()
        );
    }
    let notices = engine.take_notices();
    if !notices.is_empty() {
        let messages = notices
            .into_iter()
            .map(|notice| notice.message)
            .collect::<Vec<_>>();
        bail!("{}", messages.join("\n"));
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;
    let mut stdout = io::stdout();
    write!(stdout, "{}: ", label)?;
    stdout.flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim_end().to_owned())
}

fn read_stdin() -> Result<Option<String>> {
    if atty::is(atty::Stream::Stdin) {
        return Ok(None);
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(Some(buf))
}

fn format_trip_list(trips: &[TripSummary]) -> String {
    if trips.is_empty() {
        return "No trips yet. Run `tripdesk seed` or `tripdesk new-trip`.\n".to_string();
    }
    let mut out = String::new();
    for trip in trips {
        let _ = writeln!(
            &mut out,
            "{}  {}  ({} day{}, updated {})",
            trip.id,
            trip.title,
            trip.days,
            if trip.days == 1 { "" } else { "s" },
            format_day(trip.updated_at)
        );
    }
    out
}

fn format_day(epoch: i64) -> String {
    OffsetDateTime::from_unix_timestamp(epoch)
        .map(|dt| dt.date().to_string())
        .unwrap_or_else(|_| epoch.to_string())
}

/// Plain-text outline of a trip, one line per day, entry and todo.
pub fn render_tree(trip: &Trip) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "{}  [{}]", trip.title, trip.id);
    for line in trip.description.lines().filter(|line| !line.trim().is_empty()) {
        let _ = writeln!(&mut out, "  {line}");
    }
    for (number, day) in trip.days.iter().enumerate() {
        let title = if day.title.trim().is_empty() {
            "(untitled day)"
        } else {
            day.title.as_str()
        };
        let mut headline = format!("Day {}: {title}", number + 1);
        if let Some(date) = day.date {
            let _ = write!(&mut headline, " ({date})");
        }
        let _ = writeln!(&mut out, "{headline}  [{}]", day.id);

        for entry in &day.entries {
            let mut line = format!("  - ({}) {}", entry.kind.entry_type(), entry.title);
            match &entry.kind {
                EntryKind::Place { address } if !address.trim().is_empty() => {
                    let _ = write!(&mut line, " @ {}", address.trim());
                }
                EntryKind::Note { body } => {
                    if let Some(first) = body.lines().map(str::trim).find(|l| !l.is_empty()) {
                        let _ = write!(&mut line, ": {first}");
                    }
                }
                _ => {}
            }
            let _ = writeln!(&mut out, "{line}  [{}]", entry.id);
            if let EntryKind::Todos { todos } = &entry.kind {
                for todo in todos {
                    let mark = if todo.completed { 'x' } else { ' ' };
                    let _ = writeln!(&mut out, "      [{mark}] {}  [{}]", todo.title, todo.id);
                }
            }
        }
    }
    out
}
