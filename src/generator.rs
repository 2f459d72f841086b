//! Randomized request payloads with caller overrides.
//!
//! Each entity kind is a registered [`EntitySchema`]. Generated values always
//! satisfy their field's format but differ between calls, so parallel tests
//! do not collide on unique fields such as email. Overrides are merged
//! shallowly on top and win verbatim.

use std::collections::BTreeMap;

use chrono::Utc;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

const FIRST_NAMES: &[&str] = &[
    "Leanne", "Ervin", "Clementine", "Patricia", "Chelsey", "Dennis", "Kurtis", "Nicholas",
    "Glenna", "Clementina", "Ada", "Grace", "Linus", "Barbara", "Ken", "Margaret",
];

const LAST_NAMES: &[&str] = &[
    "Graham", "Howell", "Bauch", "Lebsack", "Dietrich", "Schulist", "Weissnat", "Runolfsdottir",
    "Reichert", "DuBuque", "Lovelace", "Hopper", "Torvalds", "Liskov", "Thompson", "Hamilton",
];

const WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing", "elit", "sed", "do",
    "eiusmod", "tempor", "incididunt", "labore", "dolore", "magna", "aliqua", "enim", "minim",
    "veniam", "quis", "nostrud", "exercitation", "ullamco", "laboris", "nisi", "aliquip",
];

const DOMAINS: &[&str] = &["example.com", "example.org", "example.net", "test.local"];

/// Format constraint for one generated field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFormat {
    /// Positive integer identifier.
    Id,
    /// Integer in `[min, max]` inclusive.
    Integer { min: i64, max: i64 },
    /// `local@domain`, unique per call.
    Email,
    /// "First Last".
    PersonName,
    /// Lowercase handle.
    Username,
    /// Digits and dashes.
    Phone,
    /// `https://` URL.
    Url,
    /// Between `min` and `max` lorem words.
    Words { min: usize, max: usize },
    /// Capitalized sentence ending in a period.
    Sentence,
    /// Several sentences.
    Paragraph,
    Boolean,
    Uuid,
    /// RFC 3339 timestamp (now).
    Timestamp,
}

/// A named field and its format.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub format: FieldFormat,
}

/// Ordered list of fields for one entity kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitySchema {
    fields: Vec<FieldSpec>,
}

impl EntitySchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a field.
    pub fn field(mut self, name: impl Into<String>, format: FieldFormat) -> Self {
        let name = name.into();
        self.fields.retain(|f| f.name != name);
        self.fields.push(FieldSpec { name, format });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Schema for `user`.
    pub fn user() -> Self {
        Self::new()
            .field("id", FieldFormat::Id)
            .field("name", FieldFormat::PersonName)
            .field("username", FieldFormat::Username)
            .field("email", FieldFormat::Email)
            .field("phone", FieldFormat::Phone)
            .field("website", FieldFormat::Url)
    }

    /// Schema for `post`.
    pub fn post() -> Self {
        Self::new()
            .field("id", FieldFormat::Id)
            .field("userId", FieldFormat::Id)
            .field("title", FieldFormat::Words { min: 3, max: 8 })
            .field("body", FieldFormat::Paragraph)
    }

    /// Schema for `comment`.
    pub fn comment() -> Self {
        Self::new()
            .field("id", FieldFormat::Id)
            .field("postId", FieldFormat::Id)
            .field("name", FieldFormat::Sentence)
            .field("email", FieldFormat::Email)
            .field("body", FieldFormat::Paragraph)
    }

    /// Schema for `todo`.
    pub fn todo() -> Self {
        Self::new()
            .field("id", FieldFormat::Id)
            .field("userId", FieldFormat::Id)
            .field("title", FieldFormat::Words { min: 2, max: 6 })
            .field("completed", FieldFormat::Boolean)
    }
}

/// Typed `user` entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub username: String,
    pub email: String,
    pub phone: String,
    pub website: String,
}

/// Typed `post` entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: u64,
    pub user_id: u64,
    pub title: String,
    pub body: String,
}

/// Generates payloads for registered entity kinds.
#[derive(Debug, Clone)]
pub struct DataGenerator {
    schemas: BTreeMap<String, EntitySchema>,
}

impl DataGenerator {
    /// Creates a generator with the built-in kinds: user, post, comment, todo.
    pub fn new() -> Self {
        Self::empty()
            .with_schema("user", EntitySchema::user())
            .with_schema("post", EntitySchema::post())
            .with_schema("comment", EntitySchema::comment())
            .with_schema("todo", EntitySchema::todo())
    }

    /// Creates a generator with no kinds registered.
    pub fn empty() -> Self {
        Self {
            schemas: BTreeMap::new(),
        }
    }

    /// Registers a kind, replacing any existing schema of that name.
    pub fn register(&mut self, kind: impl Into<String>, schema: EntitySchema) {
        self.schemas.insert(kind.into(), schema);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_schema(mut self, kind: impl Into<String>, schema: EntitySchema) -> Self {
        self.register(kind, schema);
        self
    }

    /// Registered kind names, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        self.schemas.keys().map(String::as_str).collect()
    }

    /// Returns the schema for `kind`, if registered.
    pub fn schema(&self, kind: &str) -> Option<&EntitySchema> {
        self.schemas.get(kind)
    }

    /// Generates one entity of `kind` with `overrides` merged on top.
    ///
    /// Fields present in `overrides` replace generated ones verbatim; fields
    /// not in the schema are added as-is.
    pub fn generate(&self, kind: &str, overrides: Option<Value>) -> Result<Value> {
        let schema = self
            .schemas
            .get(kind)
            .ok_or_else(|| Error::UnknownEntityKind(kind.to_string()))?;

        let overrides = match overrides {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => return Err(Error::InvalidOverrides(json_kind(&other).to_string())),
        };

        let mut rng = rand::rng();
        let mut entity = Map::new();
        for field in schema.fields() {
            if !overrides.contains_key(&field.name) {
                entity.insert(field.name.clone(), generate_value(&mut rng, &field.format));
            }
        }
        entity.extend(overrides);

        Ok(Value::Object(entity))
    }

    /// Generates an entity and deserializes it into `T`.
    pub fn generate_as<T: DeserializeOwned>(&self, kind: &str, overrides: Option<Value>) -> Result<T> {
        let value = self.generate(kind, overrides)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Generates `count` entities of `kind`, without overrides.
    pub fn generate_many(&self, kind: &str, count: usize) -> Result<Vec<Value>> {
        (0..count).map(|_| self.generate(kind, None)).collect()
    }

    /// Typed `user`.
    pub fn user(&self, overrides: Option<Value>) -> Result<User> {
        self.generate_as("user", overrides)
    }

    /// Typed `post`.
    pub fn post(&self, overrides: Option<Value>) -> Result<Post> {
        self.generate_as("post", overrides)
    }
}

impl Default for DataGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn pick<'a, R: Rng>(rng: &mut R, items: &[&'a str]) -> &'a str {
    items[rng.random_range(0..items.len())]
}

fn words<R: Rng>(rng: &mut R, count: usize) -> String {
    (0..count)
        .map(|_| pick(rng, WORDS))
        .collect::<Vec<_>>()
        .join(" ")
}

fn sentence<R: Rng>(rng: &mut R) -> String {
    let count = rng.random_range(4..=10);
    let text = words(rng, count);
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => format!("{}{}.", first.to_uppercase(), chars.as_str()),
        None => String::new(),
    }
}

fn short_unique() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn generate_value<R: Rng>(rng: &mut R, format: &FieldFormat) -> Value {
    match format {
        FieldFormat::Id => Value::from(rng.random_range(1..=1_000_000u64)),
        FieldFormat::Integer { min, max } => {
            let (lo, hi) = if min <= max { (*min, *max) } else { (*max, *min) };
            Value::from(rng.random_range(lo..=hi))
        }
        FieldFormat::Email => {
            let local = format!(
                "{}.{}.{}",
                pick(rng, FIRST_NAMES).to_lowercase(),
                pick(rng, LAST_NAMES).to_lowercase(),
                short_unique()
            );
            Value::from(format!("{}@{}", local, pick(rng, DOMAINS)))
        }
        FieldFormat::PersonName => {
            Value::from(format!("{} {}", pick(rng, FIRST_NAMES), pick(rng, LAST_NAMES)))
        }
        FieldFormat::Username => Value::from(format!(
            "{}_{}{}",
            pick(rng, FIRST_NAMES).to_lowercase(),
            pick(rng, LAST_NAMES).to_lowercase(),
            rng.random_range(1..1000)
        )),
        FieldFormat::Phone => Value::from(format!(
            "{:03}-{:03}-{:04}",
            rng.random_range(200..1000),
            rng.random_range(0..1000),
            rng.random_range(0..10000)
        )),
        FieldFormat::Url => Value::from(format!(
            "https://{}-{}.{}",
            pick(rng, WORDS),
            rng.random_range(1..10000),
            pick(rng, DOMAINS)
        )),
        FieldFormat::Words { min, max } => {
            let (lo, hi) = if min <= max { (*min, *max) } else { (*max, *min) };
            let count = rng.random_range(lo.max(1)..=hi.max(1));
            Value::from(words(rng, count))
        }
        FieldFormat::Sentence => Value::from(sentence(rng)),
        FieldFormat::Paragraph => {
            let count = rng.random_range(2..=4);
            let text = (0..count).map(|_| sentence(rng)).collect::<Vec<_>>().join(" ");
            Value::from(text)
        }
        FieldFormat::Boolean => Value::from(rng.random_bool(0.5)),
        FieldFormat::Uuid => Value::from(uuid::Uuid::new_v4().to_string()),
        FieldFormat::Timestamp => Value::from(Utc::now().to_rfc3339()),
    }
}
