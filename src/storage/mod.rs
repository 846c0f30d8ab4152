use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rusqlite::config::DbConfig;
use rusqlite::types::{FromSql, FromSqlResult, ToSqlOutput, Type, ValueRef};
use rusqlite::{
    params, Connection, OptionalExtension, Row, ToSql, Transaction, TransactionBehavior,
};
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::config::StorageOptions;
use crate::model::{
    validate_edit, validate_title, ChildDraft, EntityId, EntityKind, EntityRecord, EntityRef,
    Entry, EntryKind, EntryType, Field, FieldValue, Itinerary, Node, Todo, Trip,
};
use crate::sync::transport::{RemoteError, RemoteService};

mod schema;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripSummary {
    pub id: EntityId,
    pub title: String,
    pub days: usize,
    pub updated_at: i64,
}

/// SQLite-backed trip store. It is the remote side of the sync engine, so
/// every [`RemoteService`] call opens its own connection and runs in one
/// transaction.
#[derive(Clone)]
pub struct TripStore {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
}

impl TripStore {
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)
            .with_context(|| format!("opening database {}", self.db_path.display()))?;
        prepare_connection(&conn, &self.options)?;
        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    fn remote_tx<F, T>(&self, f: F) -> Result<T, RemoteError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, RemoteError>,
    {
        let mut conn = self
            .connect()
            .map_err(|err| RemoteError::Transient(format!("{err:#}")))?;
        // Deferred read-then-write transactions skip the busy handler in WAL.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    pub fn list_trips(&self) -> Result<Vec<TripSummary>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id,
                        t.title,
                        (SELECT COUNT(*) FROM itineraries i WHERE i.trip_id = t.id),
                        t.updated_at
                 FROM trips t
                 ORDER BY t.created_at, t.rowid",
            )?;
            let trips = stmt
                .query_map([], |row| {
                    Ok(TripSummary {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        days: row.get::<_, i64>(2)? as usize,
                        updated_at: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(trips)
        })
    }

    pub fn first_trip(&self) -> Result<Option<EntityId>> {
        Ok(self.list_trips()?.into_iter().next().map(|trip| trip.id))
    }

    pub fn create_trip(&self, title: &str) -> Result<EntityId> {
        if let Err(err) = validate_title(EntityKind::Trip, title) {
            bail!("invalid trip title: {err}");
        }
        let trip = Trip::new(EntityId::generate(), title.trim());
        self.with_connection(|conn| insert_trip(conn, &trip))?;
        Ok(trip.id)
    }

    pub fn seed_sample_trip(&self) -> Result<EntityId> {
        let trip = sample_trip();
        tracing::info!(trip = %trip.id, "seeding sample trip");
        self.with_connection(|conn| {
            let tx = conn.unchecked_transaction()?;
            insert_trip(&tx, &trip)?;
            tx.commit().context("committing sample trip")?;
            Ok(())
        })?;
        Ok(trip.id)
    }
}

impl RemoteService for TripStore {
    fn update_field(
        &self,
        entity: &EntityId,
        patch: &[(Field, FieldValue)],
    ) -> Result<EntityRecord, RemoteError> {
        self.remote_tx(|tx| {
            let table = locate(tx, entity)?.ok_or_else(|| RemoteError::NotFound(entity.clone()))?;
            let current = load_entity(tx, table, entity)?
                .ok_or_else(|| RemoteError::NotFound(entity.clone()))?;
            for (field, value) in patch {
                validate_edit(&current.entity(), *field, value)
                    .map_err(|err| RemoteError::Rejected(err.to_string()))?;
                let column: &str = field.as_ref();
                let sql = format!("UPDATE {} SET {column} = ?1 WHERE id = ?2", table.name());
                match value {
                    FieldValue::Text(text) if *field == Field::Title => {
                        tx.execute(&sql, params![text.trim(), entity])?
                    }
                    FieldValue::Text(text) => tx.execute(&sql, params![text, entity])?,
                    FieldValue::Date(date) => {
                        let stored = date.map(|date| date.to_string());
                        tx.execute(&sql, params![stored, entity])?
                    }
                    FieldValue::Flag(flag) => tx.execute(&sql, params![flag, entity])?,
                    FieldValue::Order(_) => {
                        return Err(RemoteError::Rejected(format!(
                            "{field} cannot be written directly"
                        )))
                    }
                };
            }
            let refreshed = load_entity(tx, table, entity)?
                .ok_or_else(|| RemoteError::NotFound(entity.clone()))?;
            Ok(EntityRecord {
                id: entity.clone(),
                fields: refreshed.entity().scalar_fields(),
            })
        })
    }

    fn reorder_siblings(
        &self,
        parent: &EntityId,
        ordered: &[EntityId],
    ) -> Result<Vec<EntityId>, RemoteError> {
        self.remote_tx(|tx| {
            let table = locate(tx, parent)?.ok_or_else(|| RemoteError::NotFound(parent.clone()))?;
            let children = child_table(tx, table, parent)?;
            let existing = child_ids(tx, children, parent)?;
            if let Some(stranger) = ordered.iter().find(|id| !existing.contains(id)) {
                return Err(RemoteError::Conflict(format!(
                    "{stranger} is not a child of {parent}"
                )));
            }
            let mut next: Vec<EntityId> = Vec::with_capacity(existing.len());
            for id in ordered.iter().chain(existing.iter()) {
                if !next.contains(id) {
                    next.push(id.clone());
                }
            }
            write_positions(tx, children, &next)?;
            Ok(next)
        })
    }

    fn create_child(&self, parent: &EntityId, draft: &ChildDraft) -> Result<Node, RemoteError> {
        self.remote_tx(|tx| {
            let table = locate(tx, parent)?.ok_or_else(|| RemoteError::NotFound(parent.clone()))?;
            let holder = load_entity(tx, table, parent)?
                .ok_or_else(|| RemoteError::NotFound(parent.clone()))?;
            draft
                .validate_under(&holder.entity())
                .map_err(|err| RemoteError::Rejected(err.to_string()))?;
            if locate(tx, &draft.id)?.is_some() {
                return Err(RemoteError::Conflict(format!("{} already exists", draft.id)));
            }
            let children = child_table(tx, table, parent)?;
            let position: u32 = tx.query_row(
                &format!(
                    "SELECT COALESCE(MAX(position), -1) + 1 FROM {} WHERE {} = ?1",
                    children.name(),
                    children.parent_column()
                ),
                [parent],
                |row| row.get(0),
            )?;
            let node = draft.clone().into_node(position);
            insert_node(tx, parent, &node)?;
            Ok(node)
        })
    }

    fn delete_entity(&self, entity: &EntityId) -> Result<(), RemoteError> {
        self.remote_tx(|tx| {
            let table = locate(tx, entity)?.ok_or_else(|| RemoteError::NotFound(entity.clone()))?;
            let parent: Option<EntityId> = if table == Table::Trip {
                None
            } else {
                tx.query_row(
                    &format!(
                        "SELECT {} FROM {} WHERE id = ?1",
                        table.parent_column(),
                        table.name()
                    ),
                    [entity],
                    |row| row.get(0),
                )
                .optional()?
            };
            tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table.name()), [entity])?;
            if let Some(parent) = parent {
                let remaining = child_ids(tx, table, &parent)?;
                write_positions(tx, table, &remaining)?;
            }
            Ok(())
        })
    }

    fn fetch_trip(&self, trip: &EntityId) -> Result<Trip, RemoteError> {
        self.remote_tx(|tx| load_trip(tx, trip)?.ok_or_else(|| RemoteError::NotFound(trip.clone())))
    }
}

impl From<rusqlite::Error> for RemoteError {
    fn from(err: rusqlite::Error) -> Self {
        RemoteError::Transient(err.to_string())
    }
}

impl ToSql for EntityId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EntityId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str().map(EntityId::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Trip,
    Itinerary,
    Entry,
    Todo,
}

impl Table {
    const ALL: [Table; 4] = [Table::Trip, Table::Itinerary, Table::Entry, Table::Todo];

    fn name(self) -> &'static str {
        match self {
            Table::Trip => "trips",
            Table::Itinerary => "itineraries",
            Table::Entry => "entries",
            Table::Todo => "todos",
        }
    }

    /// Column linking a row to the row that holds it.
    fn parent_column(self) -> &'static str {
        match self {
            Table::Trip => "id",
            Table::Itinerary => "trip_id",
            Table::Entry => "itinerary_id",
            Table::Todo => "entry_id",
        }
    }
}

/// An entity read on its own, without its children.
enum Loaded {
    Trip(Trip),
    Node(Node),
}

impl Loaded {
    fn entity(&self) -> EntityRef<'_> {
        match self {
            Loaded::Trip(trip) => EntityRef::Trip(trip),
            Loaded::Node(node) => node.as_entity(),
        }
    }
}

const ITINERARY_COLUMNS: &str = "id, title, date, position";
const ENTRY_COLUMNS: &str = "id, entry_type, title, description, address, body, position";
const TODO_COLUMNS: &str = "id, title, completed, position";

fn locate(conn: &Connection, id: &EntityId) -> rusqlite::Result<Option<Table>> {
    for table in Table::ALL {
        let found: Option<i64> = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE id = ?1", table.name()),
                [id],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_some() {
            return Ok(Some(table));
        }
    }
    Ok(None)
}

/// The table holding children of `id`, which lives in `table`.
fn child_table(conn: &Connection, table: Table, id: &EntityId) -> Result<Table, RemoteError> {
    match table {
        Table::Trip => Ok(Table::Itinerary),
        Table::Itinerary => Ok(Table::Entry),
        Table::Entry => {
            let entry_type: EntryType = conn.query_row(
                "SELECT entry_type FROM entries WHERE id = ?1",
                [id],
                |row| parse_column(row, 0),
            )?;
            if entry_type == EntryType::Todos {
                Ok(Table::Todo)
            } else {
                Err(RemoteError::Conflict(format!("{entry_type} entry {id} holds no items")))
            }
        }
        Table::Todo => Err(RemoteError::Conflict(format!("todo {id} holds no items"))),
    }
}

fn child_ids(conn: &Connection, table: Table, parent: &EntityId) -> rusqlite::Result<Vec<EntityId>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {} WHERE {} = ?1 ORDER BY position, rowid",
        table.name(),
        table.parent_column()
    ))?;
    let ids = stmt
        .query_map([parent], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn write_positions(conn: &Connection, table: Table, ids: &[EntityId]) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&format!(
        "UPDATE {} SET position = ?1 WHERE id = ?2",
        table.name()
    ))?;
    for (position, id) in ids.iter().enumerate() {
        stmt.execute(params![position as i64, id])?;
    }
    Ok(())
}

fn load_trip(conn: &Connection, id: &EntityId) -> rusqlite::Result<Option<Trip>> {
    let trip = conn
        .query_row(
            "SELECT id, title, description FROM trips WHERE id = ?1",
            [id],
            read_trip,
        )
        .optional()?;
    let Some(mut trip) = trip else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITINERARY_COLUMNS} FROM itineraries WHERE trip_id = ?1 ORDER BY position, rowid"
    ))?;
    trip.days = stmt
        .query_map([id], read_itinerary)?
        .collect::<Result<Vec<_>, _>>()?;
    for day in &mut trip.days {
        day.entries = load_entries(conn, &day.id)?;
    }
    Ok(Some(trip))
}

fn load_entries(conn: &Connection, day: &EntityId) -> rusqlite::Result<Vec<Entry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries WHERE itinerary_id = ?1 ORDER BY position, rowid"
    ))?;
    let mut entries = stmt
        .query_map([day], read_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    for entry in &mut entries {
        if let EntryKind::Todos { todos } = &mut entry.kind {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TODO_COLUMNS} FROM todos WHERE entry_id = ?1 ORDER BY position, rowid"
            ))?;
            *todos = stmt
                .query_map([&entry.id], read_todo)?
                .collect::<Result<Vec<_>, _>>()?;
        }
    }
    Ok(entries)
}

fn load_entity(conn: &Connection, table: Table, id: &EntityId) -> rusqlite::Result<Option<Loaded>> {
    let loaded = match table {
        Table::Trip => conn
            .query_row(
                "SELECT id, title, description FROM trips WHERE id = ?1",
                [id],
                read_trip,
            )
            .optional()?
            .map(Loaded::Trip),
        Table::Itinerary => conn
            .query_row(
                &format!("SELECT {ITINERARY_COLUMNS} FROM itineraries WHERE id = ?1"),
                [id],
                read_itinerary,
            )
            .optional()?
            .map(|day| Loaded::Node(Node::Itinerary(day))),
        Table::Entry => conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1"),
                [id],
                read_entry,
            )
            .optional()?
            .map(|entry| Loaded::Node(Node::Entry(entry))),
        Table::Todo => conn
            .query_row(
                &format!("SELECT {TODO_COLUMNS} FROM todos WHERE id = ?1"),
                [id],
                read_todo,
            )
            .optional()?
            .map(|todo| Loaded::Node(Node::Todo(todo))),
    };
    Ok(loaded)
}

fn read_trip(row: &Row<'_>) -> rusqlite::Result<Trip> {
    Ok(Trip {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        days: Vec::new(),
    })
}

fn read_itinerary(row: &Row<'_>) -> rusqlite::Result<Itinerary> {
    let date = match row.get::<_, Option<String>>(2)? {
        Some(raw) => Some(parse_date(&raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(err))
        })?),
        None => None,
    };
    Ok(Itinerary {
        id: row.get(0)?,
        title: row.get(1)?,
        date,
        order: row.get(3)?,
        entries: Vec::new(),
    })
}

fn read_entry(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let kind = match parse_column::<EntryType>(row, 1)? {
        EntryType::Place => EntryKind::Place {
            address: row.get(4)?,
        },
        EntryType::Note => EntryKind::Note { body: row.get(5)? },
        EntryType::Todos => EntryKind::Todos { todos: Vec::new() },
    };
    Ok(Entry {
        id: row.get(0)?,
        title: row.get(2)?,
        description: row.get(3)?,
        order: row.get(6)?,
        kind,
    })
}

fn read_todo(row: &Row<'_>) -> rusqlite::Result<Todo> {
    Ok(Todo {
        id: row.get(0)?,
        title: row.get(1)?,
        completed: row.get(2)?,
        order: row.get(3)?,
    })
}

fn parse_column<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(index)?;
    raw.parse::<T>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err)))
}

fn parse_date(raw: &str) -> Result<Date, time::error::Parse> {
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
}

fn insert_trip(conn: &Connection, trip: &Trip) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO trips (id, title, description, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![&trip.id, &trip.title, &trip.description, now],
    )
    .context("inserting trip")?;
    for day in &trip.days {
        insert_node(conn, &trip.id, &Node::Itinerary(day.clone()))
            .with_context(|| format!("inserting day {}", day.id))?;
    }
    Ok(())
}

/// Writes `node` and its whole subtree under `parent`.
fn insert_node(conn: &Connection, parent: &EntityId, node: &Node) -> rusqlite::Result<()> {
    match node {
        Node::Itinerary(day) => {
            let date = day.date.map(|date| date.to_string());
            conn.execute(
                "INSERT INTO itineraries (id, trip_id, title, date, position)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![&day.id, parent, &day.title, date, day.order],
            )?;
            for entry in &day.entries {
                insert_node(conn, &day.id, &Node::Entry(entry.clone()))?;
            }
        }
        Node::Entry(entry) => {
            let (address, body) = match &entry.kind {
                EntryKind::Place { address } => (address.as_str(), ""),
                EntryKind::Note { body } => ("", body.as_str()),
                EntryKind::Todos { .. } => ("", ""),
            };
            conn.execute(
                "INSERT INTO entries (id, itinerary_id, entry_type, title, description, address, body, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    &entry.id,
                    parent,
                    entry.kind.entry_type().to_string(),
                    &entry.title,
                    &entry.description,
                    address,
                    body,
                    entry.order
                ],
            )?;
            if let EntryKind::Todos { todos } = &entry.kind {
                for todo in todos {
                    insert_node(conn, &entry.id, &Node::Todo(todo.clone()))?;
                }
            }
        }
        Node::Todo(todo) => {
            conn.execute(
                "INSERT INTO todos (id, entry_id, title, completed, position)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![&todo.id, parent, &todo.title, todo.completed, todo.order],
            )?;
        }
    }
    Ok(())
}

pub fn init(storage: &StorageOptions) -> Result<TripStore> {
    let db_path = &storage.database_path;
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    prepare_connection(&conn, storage)?;
    schema::apply(&conn)?;
    Ok(TripStore {
        db_path: Arc::new(db_path.clone()),
        options: Arc::new(storage.clone()),
    })
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> Result<()> {
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FKEY, true)
        .context("enabling foreign keys")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )
    .context("setting wal_autocheckpoint")?;
    // Transport workers write concurrently.
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("setting busy timeout")?;
    Ok(())
}

fn sample_trip() -> Trip {
    let mut trip = Trip::new(EntityId::generate(), "Lisbon long weekend");
    trip.description = "Three days of hills, tiles and custard tarts.".into();
    let root = trip.id.clone();

    let alfama = add(
        &mut trip,
        &root,
        ChildDraft::day("Alfama & Baixa", Some(time::macros::date!(2025 - 05 - 02))),
        &[],
    );
    add(
        &mut trip,
        &alfama,
        ChildDraft::entry(EntryType::Place, "Castelo de São Jorge"),
        &[(Field::Address, FieldValue::text("R. de Santa Cruz do Castelo"))],
    );
    add(
        &mut trip,
        &alfama,
        ChildDraft::entry(EntryType::Note, "Lunch"),
        &[(
            Field::Body,
            FieldValue::text("Grilled sardines at a tasca near Largo do Chafariz de Dentro."),
        )],
    );
    let packing = add(
        &mut trip,
        &alfama,
        ChildDraft::entry(EntryType::Todos, "Before leaving the hotel"),
        &[],
    );
    for todo in ["Buy a Viva Viagem card", "Charge the camera", "Book a fado dinner"] {
        add(&mut trip, &packing, ChildDraft::todo(todo), &[]);
    }

    let belem = add(
        &mut trip,
        &root,
        ChildDraft::day("Belém", Some(time::macros::date!(2025 - 05 - 03))),
        &[],
    );
    add(
        &mut trip,
        &belem,
        ChildDraft::entry(EntryType::Place, "Jerónimos Monastery"),
        &[(Field::Address, FieldValue::text("Praça do Império"))],
    );
    add(
        &mut trip,
        &belem,
        ChildDraft::entry(EntryType::Place, "Pastéis de Belém"),
        &[(Field::Address, FieldValue::text("R. de Belém 84-92"))],
    );

    let sintra = add(&mut trip, &root, ChildDraft::day("Sintra", None), &[]);
    add(
        &mut trip,
        &sintra,
        ChildDraft::entry(EntryType::Note, "Train"),
        &[(
            Field::Body,
            FieldValue::text("From Rossio station, every 20 minutes."),
        )],
    );
    trip
}

fn add(
    trip: &mut Trip,
    parent: &EntityId,
    draft: ChildDraft,
    fields: &[(Field, FieldValue)],
) -> EntityId {
    let id = draft.id.clone();
    trip.push_child(parent, draft.into_node(0));
    if let Some(mut entity) = trip.entity_mut(&id) {
        for (field, value) in fields {
            entity.set_field(*field, value);
        }
    }
    id
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    use super::*;
    use crate::config::{ConfigPaths, SyncConfig};
    use crate::sync::SyncEngine;

    /// Delays selected calls so that requests overlap on the worker pool.
    struct Sluggish {
        inner: Arc<TripStore>,
        delay: Duration,
        slow_value: Option<FieldValue>,
        slow_create: bool,
    }

    impl Sluggish {
        fn new(inner: Arc<TripStore>) -> Self {
            Self {
                inner,
                delay: Duration::from_millis(300),
                slow_value: None,
                slow_create: false,
            }
        }
    }

    impl RemoteService for Sluggish {
        fn update_field(
            &self,
            entity: &EntityId,
            patch: &[(Field, FieldValue)],
        ) -> Result<EntityRecord, RemoteError> {
            if let Some(slow) = &self.slow_value {
                if patch.iter().any(|(_, value)| value == slow) {
                    std::thread::sleep(self.delay);
                }
            }
            self.inner.update_field(entity, patch)
        }

        fn reorder_siblings(
            &self,
            parent: &EntityId,
            ordered: &[EntityId],
        ) -> Result<Vec<EntityId>, RemoteError> {
            self.inner.reorder_siblings(parent, ordered)
        }

        fn create_child(&self, parent: &EntityId, draft: &ChildDraft) -> Result<Node, RemoteError> {
            if self.slow_create {
                std::thread::sleep(self.delay);
            }
            self.inner.create_child(parent, draft)
        }

        fn delete_entity(&self, entity: &EntityId) -> Result<(), RemoteError> {
            self.inner.delete_entity(entity)
        }

        fn fetch_trip(&self, trip: &EntityId) -> Result<Trip, RemoteError> {
            self.inner.fetch_trip(trip)
        }
    }

    fn pooled() -> SyncConfig {
        SyncConfig {
            text_quiet: Duration::from_millis(10),
            discrete_quiet: Duration::ZERO,
            workers: 4,
            ..SyncConfig::default()
        }
    }

    fn init_store() -> anyhow::Result<(TempDir, TripStore)> {
        let temp = TempDir::new()?;
        let paths = ConfigPaths::rooted_at(temp.path());
        paths.ensure_directories()?;
        let options = StorageOptions {
            database_path: paths.database_path.clone(),
            ..StorageOptions::default()
        };
        let store = init(&options)?;
        Ok((temp, store))
    }

    fn seeded() -> anyhow::Result<(TempDir, TripStore, Trip)> {
        let (temp, store) = init_store()?;
        let id = store.seed_sample_trip()?;
        let trip = store.fetch_trip(&id)?;
        Ok((temp, store, trip))
    }

    fn todos_entry(trip: &Trip) -> &Entry {
        trip.days
            .iter()
            .flat_map(|day| day.entries.iter())
            .find(|entry| entry.kind.entry_type() == EntryType::Todos)
            .expect("sample trip has a todo list")
    }

    #[test]
    fn sample_trip_round_trips_through_sqlite() -> anyhow::Result<()> {
        let (_temp, store, trip) = seeded()?;
        assert_eq!(trip.title, "Lisbon long weekend");
        let days: Vec<_> = trip.days.iter().map(|day| day.title.as_str()).collect();
        assert_eq!(days, ["Alfama & Baixa", "Belém", "Sintra"]);
        assert_eq!(trip.days[0].date, Some(time::macros::date!(2025 - 05 - 02)));
        let orders: Vec<u32> = trip.days[0].entries.iter().map(|entry| entry.order).collect();
        assert_eq!(orders, [0, 1, 2]);
        assert_matches!(
            &trip.days[0].entries[0].kind,
            EntryKind::Place { address } if address == "R. de Santa Cruz do Castelo"
        );

        let listed = store.list_trips()?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].days, 3);
        Ok(())
    }

    #[test]
    fn updates_are_validated_and_normalised() -> anyhow::Result<()> {
        let (_temp, store, trip) = seeded()?;
        let castle = trip.days[0].entries[0].id.clone();

        let record = store.update_field(&castle, &[(Field::Title, FieldValue::text("  Castle "))])?;
        assert_eq!(record.value(Field::Title), Some(&FieldValue::text("Castle")));

        assert_matches!(
            store.update_field(&castle, &[(Field::Title, FieldValue::text(""))]),
            Err(RemoteError::Rejected(_))
        );
        assert_matches!(
            store.update_field(&castle, &[(Field::Body, FieldValue::text("nope"))]),
            Err(RemoteError::Rejected(_))
        );
        assert_matches!(
            store.update_field(
                &EntityId::from("ghost"),
                &[(Field::Title, FieldValue::text("x"))]
            ),
            Err(RemoteError::NotFound(_))
        );

        let day = trip.days[2].id.clone();
        let date = time::macros::date!(2025 - 05 - 04);
        store.update_field(&day, &[(Field::Date, FieldValue::Date(Some(date)))])?;
        assert_eq!(store.fetch_trip(&trip.id)?.days[2].date, Some(date));
        Ok(())
    }

    #[test]
    fn reorder_appends_unlisted_children_and_rejects_strangers() -> anyhow::Result<()> {
        let (_temp, store, trip) = seeded()?;
        let list = todos_entry(&trip);
        let ids: Vec<EntityId> = EntityRef::Entry(list).child_ids().unwrap_or_default();
        assert_eq!(ids.len(), 3);

        let saved = store.reorder_siblings(&list.id, &[ids[2].clone()])?;
        assert_eq!(saved, vec![ids[2].clone(), ids[0].clone(), ids[1].clone()]);

        let fetched = store.fetch_trip(&trip.id)?;
        assert_eq!(EntityRef::Entry(todos_entry(&fetched)).child_ids(), Some(saved));

        assert_matches!(
            store.reorder_siblings(&list.id, &[trip.days[0].id.clone()]),
            Err(RemoteError::Conflict(_))
        );
        let castle = trip.days[0].entries[0].id.clone();
        assert_matches!(
            store.reorder_siblings(&castle, &[]),
            Err(RemoteError::Conflict(_))
        );
        Ok(())
    }

    #[test]
    fn create_appends_and_delete_cascades() -> anyhow::Result<()> {
        let (_temp, store, trip) = seeded()?;
        let list = todos_entry(&trip).id.clone();

        let draft = ChildDraft::todo(" Sunscreen ");
        let node = store.create_child(&list, &draft)?;
        assert_eq!(node.id(), &draft.id);
        assert_eq!(node.title(), "Sunscreen");
        assert_matches!(node, Node::Todo(Todo { order: 3, .. }));
        assert_matches!(
            store.create_child(&list, &draft),
            Err(RemoteError::Conflict(_))
        );
        assert_matches!(
            store.create_child(&trip.days[0].entries[0].id, &ChildDraft::todo("x")),
            Err(RemoteError::Rejected(_))
        );

        let first_day = trip.days[0].id.clone();
        store.delete_entity(&first_day)?;
        let remaining: i64 = store.with_connection(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM todos", [], |row| row.get(0))?)
        })?;
        assert_eq!(remaining, 0);

        let fetched = store.fetch_trip(&trip.id)?;
        let orders: Vec<u32> = fetched.days.iter().map(|day| day.order).collect();
        assert_eq!(orders, [0, 1]);
        assert_matches!(
            store.delete_entity(&first_day),
            Err(RemoteError::NotFound(_))
        );
        Ok(())
    }

    #[test]
    fn engine_changes_land_in_the_database() -> anyhow::Result<()> {
        let (_temp, store, trip) = seeded()?;
        let store = Arc::new(store);
        let config = SyncConfig {
            text_quiet: Duration::from_millis(10),
            ..SyncConfig::default()
        };
        let mut engine = SyncEngine::connect(store.clone(), &trip.id, &config)?;

        let castle = trip.days[0].entries[0].id.clone();
        engine.edit_field(&castle, Field::Title, FieldValue::text("São Jorge Castle"))?;
        engine.flush_all();
        assert!(engine.wait_idle(Duration::from_secs(5)));

        let list = todos_entry(&trip);
        let last = EntityRef::Entry(list).child_ids().unwrap_or_default()[2].clone();
        assert!(engine.move_sibling(&list.id, &last, 0)?);
        assert!(engine.wait_idle(Duration::from_secs(5)));

        let stored = store.fetch_trip(&trip.id)?;
        assert_eq!(&stored, engine.canonical());
        assert_eq!(engine.snapshot(), engine.canonical());
        assert!(engine.notices().is_empty());
        Ok(())
    }

    #[test]
    fn quick_toggles_leave_the_last_value_on_the_remote() -> anyhow::Result<()> {
        let (_temp, store, trip) = seeded()?;
        let store = Arc::new(store);
        let list = todos_entry(&trip);
        let todo = EntityRef::Entry(list).child_ids().unwrap_or_default()[0].clone();
        let Some(FieldValue::Flag(done)) = trip.field(&todo, Field::Completed) else {
            panic!("todo has no completed flag");
        };

        let mut remote = Sluggish::new(store.clone());
        remote.slow_value = Some(FieldValue::Flag(!done));
        let mut engine = SyncEngine::connect(Arc::new(remote), &trip.id, &pooled())?;
        engine.edit_field(&todo, Field::Completed, FieldValue::Flag(!done))?;
        engine.edit_field(&todo, Field::Completed, FieldValue::Flag(done))?;
        assert_eq!(engine.pending_writes(), 2);
        assert!(engine.wait_idle(Duration::from_secs(5)));

        let stored = store.fetch_trip(&trip.id)?;
        assert_eq!(stored.field(&todo, Field::Completed), Some(FieldValue::Flag(done)));
        assert_eq!(&stored, engine.canonical());
        assert!(engine.notices().is_empty());
        Ok(())
    }

    #[test]
    fn moving_a_child_that_is_still_being_created() -> anyhow::Result<()> {
        let (_temp, store, trip) = seeded()?;
        let store = Arc::new(store);
        let list = todos_entry(&trip).id.clone();

        let mut remote = Sluggish::new(store.clone());
        remote.slow_create = true;
        let mut engine = SyncEngine::connect(Arc::new(remote), &trip.id, &pooled())?;
        let added = engine.add_child(&list, ChildDraft::todo("Sunscreen"))?;
        assert!(engine.move_sibling(&list, &added, 0)?);
        assert!(engine.wait_idle(Duration::from_secs(5)));

        assert!(engine.notices().is_empty());
        let stored = store.fetch_trip(&trip.id)?;
        let order = stored.child_ids(&list).unwrap_or_default();
        assert_eq!(order.first(), Some(&added));
        assert_eq!(order.len(), 4);
        assert_eq!(&stored, engine.canonical());
        assert_eq!(engine.snapshot(), engine.canonical());
        Ok(())
    }

    #[test]
    fn concurrent_writers_wait_for_the_lock() -> anyhow::Result<()> {
        let (_temp, store, trip) = seeded()?;
        let todos = EntityRef::Entry(todos_entry(&trip))
            .child_ids()
            .unwrap_or_default();
        assert_eq!(todos.len(), 3);

        let failures: Vec<RemoteError> = std::thread::scope(|scope| {
            let writers: Vec<_> = todos
                .iter()
                .map(|todo| {
                    let store = &store;
                    scope.spawn(move || {
                        (0..50)
                            .filter_map(|round| {
                                let title = FieldValue::text(format!("pass {round}"));
                                store.update_field(todo, &[(Field::Title, title)]).err()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            writers
                .into_iter()
                .flat_map(|writer| writer.join().unwrap())
                .collect()
        });
        assert!(failures.is_empty(), "writers failed: {failures:?}");

        let stored = store.fetch_trip(&trip.id)?;
        for todo in &todos {
            assert_eq!(stored.field(todo, Field::Title), Some(FieldValue::text("pass 49")));
        }
        Ok(())
    }
}
