use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use time::Date;

use super::{EntityId, EntityKind, Field, FieldValue, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip {
    pub id: EntityId,
    pub title: String,
    pub description: String,
    pub days: Vec<Itinerary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Itinerary {
    pub id: EntityId,
    pub title: String,
    pub date: Option<Date>,
    pub order: u32,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntityId,
    pub title: String,
    pub description: String,
    pub order: u32,
    #[serde(flatten)]
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    Place { address: String },
    Note { body: String },
    Todos { todos: Vec<Todo> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: EntityId,
    pub title: String,
    pub completed: bool,
    pub order: u32,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Place,
    Note,
    Todos,
}

impl EntryKind {
    pub fn entry_type(&self) -> EntryType {
        match self {
            EntryKind::Place { .. } => EntryType::Place,
            EntryKind::Note { .. } => EntryType::Note,
            EntryKind::Todos { .. } => EntryType::Todos,
        }
    }

    pub fn empty(entry_type: EntryType) -> Self {
        match entry_type {
            EntryType::Place => EntryKind::Place {
                address: String::new(),
            },
            EntryType::Note => EntryKind::Note {
                body: String::new(),
            },
            EntryType::Todos => EntryKind::Todos { todos: Vec::new() },
        }
    }
}

/// Any entity that lives in a parent's child list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Itinerary(Itinerary),
    Entry(Entry),
    Todo(Todo),
}

impl Node {
    pub fn id(&self) -> &EntityId {
        match self {
            Node::Itinerary(day) => &day.id,
            Node::Entry(entry) => &entry.id,
            Node::Todo(todo) => &todo.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Node::Itinerary(_) => EntityKind::Itinerary,
            Node::Entry(_) => EntityKind::Entry,
            Node::Todo(_) => EntityKind::Todo,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Node::Itinerary(day) => &day.title,
            Node::Entry(entry) => &entry.title,
            Node::Todo(todo) => &todo.title,
        }
    }

    pub fn as_entity(&self) -> EntityRef<'_> {
        match self {
            Node::Itinerary(day) => EntityRef::Itinerary(day),
            Node::Entry(entry) => EntityRef::Entry(entry),
            Node::Todo(todo) => EntityRef::Todo(todo),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "draft", rename_all = "snake_case")]
pub enum DraftKind {
    Day { date: Option<Date> },
    Entry { entry_type: EntryType },
    Todo,
}

/// A child about to be created. The id is assigned locally and kept by the
/// remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildDraft {
    pub id: EntityId,
    pub title: String,
    pub kind: DraftKind,
}

impl ChildDraft {
    pub fn day<S: Into<String>>(title: S, date: Option<Date>) -> Self {
        Self {
            id: EntityId::generate(),
            title: title.into(),
            kind: DraftKind::Day { date },
        }
    }

    pub fn entry<S: Into<String>>(entry_type: EntryType, title: S) -> Self {
        Self {
            id: EntityId::generate(),
            title: title.into(),
            kind: DraftKind::Entry { entry_type },
        }
    }

    pub fn todo<S: Into<String>>(title: S) -> Self {
        Self {
            id: EntityId::generate(),
            title: title.into(),
            kind: DraftKind::Todo,
        }
    }

    pub fn child_kind(&self) -> EntityKind {
        match self.kind {
            DraftKind::Day { .. } => EntityKind::Itinerary,
            DraftKind::Entry { .. } => EntityKind::Entry,
            DraftKind::Todo => EntityKind::Todo,
        }
    }

    pub fn validate_under(&self, parent: &EntityRef<'_>) -> Result<(), ValidationError> {
        let allowed = matches!(
            (parent, &self.kind),
            (EntityRef::Trip(_), DraftKind::Day { .. })
                | (EntityRef::Itinerary(_), DraftKind::Entry { .. })
                | (
                    EntityRef::Entry(Entry {
                        kind: EntryKind::Todos { .. },
                        ..
                    }),
                    DraftKind::Todo
                )
        );
        if !allowed {
            return Err(ValidationError::ChildNotAllowed {
                parent: parent.kind(),
                child: self.child_kind(),
            });
        }
        super::validate_title(self.child_kind(), &self.title)
    }

    pub fn into_node(self, order: u32) -> Node {
        let title = self.title.trim().to_string();
        match self.kind {
            DraftKind::Day { date } => Node::Itinerary(Itinerary {
                id: self.id,
                title,
                date,
                order,
                entries: Vec::new(),
            }),
            DraftKind::Entry { entry_type } => Node::Entry(Entry {
                id: self.id,
                title,
                description: String::new(),
                order,
                kind: EntryKind::empty(entry_type),
            }),
            DraftKind::Todo => Node::Todo(Todo {
                id: self.id,
                title,
                completed: false,
                order,
            }),
        }
    }
}

const SCALAR_FIELDS: [Field; 6] = [
    Field::Title,
    Field::Description,
    Field::Date,
    Field::Address,
    Field::Body,
    Field::Completed,
];

#[derive(Debug, Clone, Copy)]
pub enum EntityRef<'a> {
    Trip(&'a Trip),
    Itinerary(&'a Itinerary),
    Entry(&'a Entry),
    Todo(&'a Todo),
}

impl<'a> EntityRef<'a> {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Trip(_) => EntityKind::Trip,
            EntityRef::Itinerary(_) => EntityKind::Itinerary,
            EntityRef::Entry(_) => EntityKind::Entry,
            EntityRef::Todo(_) => EntityKind::Todo,
        }
    }

    pub fn id(&self) -> &'a EntityId {
        match *self {
            EntityRef::Trip(trip) => &trip.id,
            EntityRef::Itinerary(day) => &day.id,
            EntityRef::Entry(entry) => &entry.id,
            EntityRef::Todo(todo) => &todo.id,
        }
    }

    pub fn title(&self) -> &'a str {
        match *self {
            EntityRef::Trip(trip) => &trip.title,
            EntityRef::Itinerary(day) => &day.title,
            EntityRef::Entry(entry) => &entry.title,
            EntityRef::Todo(todo) => &todo.title,
        }
    }

    /// Current value of `field`, or `None` when the entity has no such field.
    pub fn field(&self, field: Field) -> Option<FieldValue> {
        match (self, field) {
            (_, Field::Title) => Some(FieldValue::text(self.title())),
            (EntityRef::Trip(trip), Field::Description) => {
                Some(FieldValue::text(trip.description.as_str()))
            }
            (EntityRef::Entry(entry), Field::Description) => {
                Some(FieldValue::text(entry.description.as_str()))
            }
            (EntityRef::Itinerary(day), Field::Date) => Some(FieldValue::Date(day.date)),
            (
                EntityRef::Entry(Entry {
                    kind: EntryKind::Place { address },
                    ..
                }),
                Field::Address,
            ) => Some(FieldValue::text(address.as_str())),
            (
                EntityRef::Entry(Entry {
                    kind: EntryKind::Note { body },
                    ..
                }),
                Field::Body,
            ) => Some(FieldValue::text(body.as_str())),
            (EntityRef::Todo(todo), Field::Completed) => Some(FieldValue::Flag(todo.completed)),
            (_, Field::Children) => self.child_ids().map(FieldValue::Order),
            _ => None,
        }
    }

    /// Every non-structural field the entity carries, with its value.
    pub fn scalar_fields(&self) -> Vec<(Field, FieldValue)> {
        SCALAR_FIELDS
            .iter()
            .filter_map(|field| self.field(*field).map(|value| (*field, value)))
            .collect()
    }

    pub fn child_ids(&self) -> Option<Vec<EntityId>> {
        match self {
            EntityRef::Trip(trip) => Some(trip.days.iter().map(|d| d.id.clone()).collect()),
            EntityRef::Itinerary(day) => {
                Some(day.entries.iter().map(|e| e.id.clone()).collect())
            }
            EntityRef::Entry(Entry {
                kind: EntryKind::Todos { todos },
                ..
            }) => Some(todos.iter().map(|t| t.id.clone()).collect()),
            _ => None,
        }
    }
}

pub enum EntityMut<'a> {
    Trip(&'a mut Trip),
    Itinerary(&'a mut Itinerary),
    Entry(&'a mut Entry),
    Todo(&'a mut Todo),
}

impl EntityMut<'_> {
    /// Writes `value` into `field`. Returns false when the field does not
    /// exist on this entity or the value has the wrong shape.
    pub fn set_field(&mut self, field: Field, value: &FieldValue) -> bool {
        match (self, field, value) {
            (EntityMut::Trip(trip), Field::Title, FieldValue::Text(text)) => {
                trip.title.clone_from(text)
            }
            (EntityMut::Trip(trip), Field::Description, FieldValue::Text(text)) => {
                trip.description.clone_from(text)
            }
            (EntityMut::Trip(trip), Field::Children, FieldValue::Order(ids)) => {
                apply_order(&mut trip.days, ids)
            }
            (EntityMut::Itinerary(day), Field::Title, FieldValue::Text(text)) => {
                day.title.clone_from(text)
            }
            (EntityMut::Itinerary(day), Field::Date, FieldValue::Date(date)) => day.date = *date,
            (EntityMut::Itinerary(day), Field::Children, FieldValue::Order(ids)) => {
                apply_order(&mut day.entries, ids)
            }
            (EntityMut::Entry(entry), Field::Title, FieldValue::Text(text)) => {
                entry.title.clone_from(text)
            }
            (EntityMut::Entry(entry), Field::Description, FieldValue::Text(text)) => {
                entry.description.clone_from(text)
            }
            (EntityMut::Entry(entry), field, value) => match (&mut entry.kind, field, value) {
                (EntryKind::Place { address }, Field::Address, FieldValue::Text(text)) => {
                    address.clone_from(text)
                }
                (EntryKind::Note { body }, Field::Body, FieldValue::Text(text)) => {
                    body.clone_from(text)
                }
                (EntryKind::Todos { todos }, Field::Children, FieldValue::Order(ids)) => {
                    apply_order(todos, ids)
                }
                _ => return false,
            },
            (EntityMut::Todo(todo), Field::Title, FieldValue::Text(text)) => {
                todo.title.clone_from(text)
            }
            (EntityMut::Todo(todo), Field::Completed, FieldValue::Flag(flag)) => {
                todo.completed = *flag
            }
            _ => return false,
        }
        true
    }
}

trait Sibling {
    fn sibling_id(&self) -> &EntityId;
    fn set_order(&mut self, order: u32);
}

impl Sibling for Itinerary {
    fn sibling_id(&self) -> &EntityId {
        &self.id
    }
    fn set_order(&mut self, order: u32) {
        self.order = order;
    }
}

impl Sibling for Entry {
    fn sibling_id(&self) -> &EntityId {
        &self.id
    }
    fn set_order(&mut self, order: u32) {
        self.order = order;
    }
}

impl Sibling for Todo {
    fn sibling_id(&self) -> &EntityId {
        &self.id
    }
    fn set_order(&mut self, order: u32) {
        self.order = order;
    }
}

fn renumber<T: Sibling>(items: &mut [T]) {
    for (index, item) in items.iter_mut().enumerate() {
        item.set_order(index as u32);
    }
}

/// Reorders `items` so the listed ids come first, in list order. Unknown and
/// duplicate ids are ignored; unlisted items keep their relative order after
/// the listed ones.
fn apply_order<T: Sibling>(items: &mut Vec<T>, ids: &[EntityId]) {
    let mut rest = std::mem::take(items);
    let mut ordered = Vec::with_capacity(rest.len());
    for id in ids {
        if let Some(pos) = rest.iter().position(|item| item.sibling_id() == id) {
            ordered.push(rest.remove(pos));
        }
    }
    ordered.extend(rest);
    *items = ordered;
    renumber(items);
}

fn insert_sibling<T: Sibling>(items: &mut Vec<T>, index: usize, item: T) {
    let index = index.min(items.len());
    items.insert(index, item);
    renumber(items);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Trip,
    Day(usize),
    Entry(usize, usize),
    Todo(usize, usize, usize),
}

impl Trip {
    pub fn new<S: Into<String>>(id: EntityId, title: S) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            days: Vec::new(),
        }
    }

    fn locate(&self, id: &EntityId) -> Option<Location> {
        if &self.id == id {
            return Some(Location::Trip);
        }
        for (d, day) in self.days.iter().enumerate() {
            if &day.id == id {
                return Some(Location::Day(d));
            }
            for (e, entry) in day.entries.iter().enumerate() {
                if &entry.id == id {
                    return Some(Location::Entry(d, e));
                }
                if let EntryKind::Todos { todos } = &entry.kind {
                    if let Some(t) = todos.iter().position(|todo| &todo.id == id) {
                        return Some(Location::Todo(d, e, t));
                    }
                }
            }
        }
        None
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.locate(id).is_some()
    }

    pub fn entity(&self, id: &EntityId) -> Option<EntityRef<'_>> {
        Some(match self.locate(id)? {
            Location::Trip => EntityRef::Trip(self),
            Location::Day(d) => EntityRef::Itinerary(&self.days[d]),
            Location::Entry(d, e) => EntityRef::Entry(&self.days[d].entries[e]),
            Location::Todo(d, e, t) => match &self.days[d].entries[e].kind {
                EntryKind::Todos { todos } => EntityRef::Todo(&todos[t]),
                _ => return None,
            },
        })
    }

    pub fn entity_mut(&mut self, id: &EntityId) -> Option<EntityMut<'_>> {
        Some(match self.locate(id)? {
            Location::Trip => EntityMut::Trip(self),
            Location::Day(d) => EntityMut::Itinerary(self.days.get_mut(d)?),
            Location::Entry(d, e) => EntityMut::Entry(self.days.get_mut(d)?.entries.get_mut(e)?),
            Location::Todo(d, e, t) => {
                match &mut self.days.get_mut(d)?.entries.get_mut(e)?.kind {
                    EntryKind::Todos { todos } => EntityMut::Todo(todos.get_mut(t)?),
                    _ => return None,
                }
            }
        })
    }

    pub fn field(&self, id: &EntityId, field: Field) -> Option<FieldValue> {
        self.entity(id)?.field(field)
    }

    pub fn child_ids(&self, parent: &EntityId) -> Option<Vec<EntityId>> {
        self.entity(parent)?.child_ids()
    }

    pub fn parent_of(&self, id: &EntityId) -> Option<EntityId> {
        match self.locate(id)? {
            Location::Trip => None,
            Location::Day(_) => Some(self.id.clone()),
            Location::Entry(d, _) => Some(self.days[d].id.clone()),
            Location::Todo(d, e, _) => Some(self.days[d].entries[e].id.clone()),
        }
    }

    /// Index of `id` within its parent's child list.
    pub fn position_of(&self, id: &EntityId) -> Option<usize> {
        match self.locate(id)? {
            Location::Trip => None,
            Location::Day(d) => Some(d),
            Location::Entry(_, e) => Some(e),
            Location::Todo(_, _, t) => Some(t),
        }
    }

    /// `id` followed by every entity nested under it.
    pub fn subtree_ids(&self, id: &EntityId) -> Vec<EntityId> {
        let mut out = Vec::new();
        let Some(entity) = self.entity(id) else {
            return out;
        };
        out.push(id.clone());
        match entity {
            EntityRef::Trip(trip) => {
                for day in &trip.days {
                    out.extend(self.subtree_ids(&day.id));
                }
            }
            EntityRef::Itinerary(day) => {
                for entry in &day.entries {
                    out.extend(self.subtree_ids(&entry.id));
                }
            }
            EntityRef::Entry(Entry {
                kind: EntryKind::Todos { todos },
                ..
            }) => out.extend(todos.iter().map(|todo| todo.id.clone())),
            _ => {}
        }
        out
    }

    /// A detached copy of the entity and its subtree.
    pub fn node(&self, id: &EntityId) -> Option<Node> {
        match self.entity(id)? {
            EntityRef::Trip(_) => None,
            EntityRef::Itinerary(day) => Some(Node::Itinerary(day.clone())),
            EntityRef::Entry(entry) => Some(Node::Entry(entry.clone())),
            EntityRef::Todo(todo) => Some(Node::Todo(todo.clone())),
        }
    }

    /// Inserts `node` under `parent` at `index` (clamped to the end). When a
    /// node with the same id already exists there, its scalar fields are
    /// refreshed and its children are kept. Returns false if the parent is
    /// missing or cannot hold this kind of node.
    pub fn insert_child(&mut self, parent: &EntityId, index: usize, node: Node) -> bool {
        if let Some(existing) = self.entity_mut(node.id()) {
            return absorb_scalars(existing, &node);
        }
        match (self.entity_mut(parent), node) {
            (Some(EntityMut::Trip(trip)), Node::Itinerary(day)) => {
                insert_sibling(&mut trip.days, index, day)
            }
            (Some(EntityMut::Itinerary(day)), Node::Entry(entry)) => {
                insert_sibling(&mut day.entries, index, entry)
            }
            (Some(EntityMut::Entry(entry)), Node::Todo(todo)) => match &mut entry.kind {
                EntryKind::Todos { todos } => insert_sibling(todos, index, todo),
                _ => return false,
            },
            _ => return false,
        }
        true
    }

    pub fn push_child(&mut self, parent: &EntityId, node: Node) -> bool {
        self.insert_child(parent, usize::MAX, node)
    }

    /// Detaches `id` and re-compacts its former siblings. Returns the parent,
    /// the former index and the removed subtree.
    pub fn remove(&mut self, id: &EntityId) -> Option<(EntityId, usize, Node)> {
        let parent = self.parent_of(id)?;
        let removed = match self.locate(id)? {
            Location::Trip => return None,
            Location::Day(d) => {
                let day = self.days.remove(d);
                renumber(&mut self.days);
                (d, Node::Itinerary(day))
            }
            Location::Entry(d, e) => {
                let entries = &mut self.days[d].entries;
                let entry = entries.remove(e);
                renumber(entries);
                (e, Node::Entry(entry))
            }
            Location::Todo(d, e, t) => match &mut self.days[d].entries[e].kind {
                EntryKind::Todos { todos } => {
                    let todo = todos.remove(t);
                    renumber(todos);
                    (t, Node::Todo(todo))
                }
                _ => return None,
            },
        };
        Some((parent, removed.0, removed.1))
    }
}

fn absorb_scalars(existing: EntityMut<'_>, node: &Node) -> bool {
    match (existing, node) {
        (EntityMut::Itinerary(current), Node::Itinerary(fresh)) => {
            current.title.clone_from(&fresh.title);
            current.date = fresh.date;
        }
        (EntityMut::Entry(current), Node::Entry(fresh)) => {
            current.title.clone_from(&fresh.title);
            current.description.clone_from(&fresh.description);
            match (&mut current.kind, &fresh.kind) {
                (EntryKind::Place { address }, EntryKind::Place { address: fresh }) => {
                    address.clone_from(fresh)
                }
                (EntryKind::Note { body }, EntryKind::Note { body: fresh }) => {
                    body.clone_from(fresh)
                }
                (EntryKind::Todos { .. }, EntryKind::Todos { .. }) => {}
                _ => return false,
            }
        }
        (EntityMut::Todo(current), Node::Todo(fresh)) => {
            current.title.clone_from(&fresh.title);
            current.completed = fresh.completed;
        }
        _ => return false,
    }
    true
}
