// src/store/records.rs
use chrono::{DateTime, Utc};

use crate::analyze::{ActorRecord, EventCategory};
use crate::error::StorageError;
use crate::ingest::types::FeedEntry;
use crate::store::batch::{Column, DataType, Field, RecordBatch, Schema};

pub const RAW_TABLE: &str = "raw";
pub const ACTORS_TABLE: &str = "actors";

/// Row type of one table, with its columnar projection.
pub trait TableRecord: Sized {
    const TABLE: &'static str;

    fn schema() -> Schema;
    fn to_batch(rows: &[Self]) -> Result<RecordBatch, StorageError>;
    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>, StorageError>;
}

/// Row of `raw`: one per feed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNewsRecord {
    pub id: String,
    pub title: String,
    pub published_time: DateTime<Utc>,
    pub body: String,
    pub link: Option<String>,
    pub thumbnail_url: Option<String>,
    pub category: Option<String>,
}

impl From<&FeedEntry> for RawNewsRecord {
    fn from(e: &FeedEntry) -> Self {
        Self {
            id: e.id.clone(),
            title: e.title.clone(),
            published_time: e.published,
            body: e.body.clone(),
            link: e.link.clone(),
            thumbnail_url: e.thumbnail_url.clone(),
            category: e.category.clone(),
        }
    }
}

/// Row of `actors`: zero or more per feed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorTableRecord {
    pub news_id: String,
    pub actor_name: String,
    pub actor_role: String,
    pub is_main_actor: bool,
    pub category: Option<String>,
}

impl From<&ActorRecord> for ActorTableRecord {
    fn from(a: &ActorRecord) -> Self {
        Self {
            news_id: a.news_id.clone(),
            actor_name: a.name.clone(),
            actor_role: a.role.clone(),
            is_main_actor: a.is_main_actor,
            category: a.category.map(|c| c.as_str().to_string()),
        }
    }
}

impl ActorTableRecord {
    pub fn event_category(&self) -> Option<EventCategory> {
        self.category.as_deref().map(EventCategory::from_label)
    }
}

fn corrupt(table: &str, detail: String) -> StorageError {
    StorageError::SchemaMismatch {
        table: table.to_string(),
        detail,
    }
}

fn utf8<'a>(
    batch: &'a RecordBatch,
    table: &str,
    name: &str,
) -> Result<&'a [Option<String>], StorageError> {
    match batch.column(name) {
        Some(Column::Utf8(v)) => Ok(v),
        _ => Err(corrupt(table, format!("missing utf8 column {name}"))),
    }
}

fn required(v: &Option<String>, table: &str, name: &str) -> Result<String, StorageError> {
    v.clone()
        .ok_or_else(|| corrupt(table, format!("null in column {name}")))
}

impl TableRecord for RawNewsRecord {
    const TABLE: &'static str = RAW_TABLE;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("published_time", DataType::TimestampMicros, false),
            Field::new("body", DataType::Utf8, false),
            Field::new("link", DataType::Utf8, true),
            Field::new("thumbnail_url", DataType::Utf8, true),
            Field::new("category", DataType::Utf8, true),
        ])
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch, StorageError> {
        RecordBatch::try_new(
            Self::TABLE,
            Self::schema(),
            vec![
                Column::Utf8(rows.iter().map(|r| Some(r.id.clone())).collect()),
                Column::Utf8(rows.iter().map(|r| Some(r.title.clone())).collect()),
                Column::TimestampMicros(
                    rows.iter()
                        .map(|r| Some(r.published_time.timestamp_micros()))
                        .collect(),
                ),
                Column::Utf8(rows.iter().map(|r| Some(r.body.clone())).collect()),
                Column::Utf8(rows.iter().map(|r| r.link.clone()).collect()),
                Column::Utf8(rows.iter().map(|r| r.thumbnail_url.clone()).collect()),
                Column::Utf8(rows.iter().map(|r| r.category.clone()).collect()),
            ],
        )
    }

    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>, StorageError> {
        let t = Self::TABLE;
        let id = utf8(batch, t, "id")?;
        let title = utf8(batch, t, "title")?;
        let body = utf8(batch, t, "body")?;
        let link = utf8(batch, t, "link")?;
        let thumb = utf8(batch, t, "thumbnail_url")?;
        let category = utf8(batch, t, "category")?;
        let Some(Column::TimestampMicros(published)) = batch.column("published_time") else {
            return Err(corrupt(t, "missing timestamp column published_time".to_string()));
        };

        (0..batch.num_rows())
            .map(|i| {
                let micros = published[i]
                    .ok_or_else(|| corrupt(t, "null in column published_time".to_string()))?;
                let published_time = DateTime::from_timestamp_micros(micros)
                    .ok_or_else(|| corrupt(t, format!("timestamp {micros} out of range")))?;
                Ok(RawNewsRecord {
                    id: required(&id[i], t, "id")?,
                    title: required(&title[i], t, "title")?,
                    published_time,
                    body: required(&body[i], t, "body")?,
                    link: link[i].clone(),
                    thumbnail_url: thumb[i].clone(),
                    category: category[i].clone(),
                })
            })
            .collect()
    }
}

impl TableRecord for ActorTableRecord {
    const TABLE: &'static str = ACTORS_TABLE;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("news_id", DataType::Utf8, false),
            Field::new("actor_name", DataType::Utf8, false),
            Field::new("actor_role", DataType::Utf8, false),
            Field::new("is_main_actor", DataType::Boolean, false),
            Field::new("category", DataType::Utf8, true),
        ])
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch, StorageError> {
        RecordBatch::try_new(
            Self::TABLE,
            Self::schema(),
            vec![
                Column::Utf8(rows.iter().map(|r| Some(r.news_id.clone())).collect()),
                Column::Utf8(rows.iter().map(|r| Some(r.actor_name.clone())).collect()),
                Column::Utf8(rows.iter().map(|r| Some(r.actor_role.clone())).collect()),
                Column::Boolean(rows.iter().map(|r| Some(r.is_main_actor)).collect()),
                Column::Utf8(rows.iter().map(|r| r.category.clone()).collect()),
            ],
        )
    }

    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>, StorageError> {
        let t = Self::TABLE;
        let news_id = utf8(batch, t, "news_id")?;
        let name = utf8(batch, t, "actor_name")?;
        let role = utf8(batch, t, "actor_role")?;
        let category = utf8(batch, t, "category")?;
        let Some(Column::Boolean(main)) = batch.column("is_main_actor") else {
            return Err(corrupt(t, "missing boolean column is_main_actor".to_string()));
        };

        (0..batch.num_rows())
            .map(|i| {
                Ok(ActorTableRecord {
                    news_id: required(&news_id[i], t, "news_id")?,
                    actor_name: required(&name[i], t, "actor_name")?,
                    actor_role: required(&role[i], t, "actor_role")?,
                    is_main_actor: main[i]
                        .ok_or_else(|| corrupt(t, "null in column is_main_actor".to_string()))?,
                    category: category[i].clone(),
                })
            })
            .collect()
    }
}
