//! Resources declared in the project file instead of in code.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use futures::future::try_join_all;
use rowsmith_core::{Record, RecordBatch};
use rowsmith_storage::{HttpFetcher, TableHandle};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{ProducerResult, Resource, Task};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub natural_key: Vec<String>,
    pub source: SourceConfig,
    #[serde(default)]
    pub fragments: Option<FragmentConfig>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// A JSON array of objects, a single object, or newline-delimited objects.
    /// Relative paths resolve against the project root.
    JsonFile { path: PathBuf },
    /// Every URL is fetched concurrently and the bodies are concatenated in
    /// declaration order. `records_pointer` selects the rows inside each body.
    HttpJson {
        urls: Vec<String>,
        #[serde(default)]
        records_pointer: Option<String>,
    },
}

/// Split `text_field` of every main record into sentence rows
/// `{parent_id, position, text}` keyed by `parent_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentConfig {
    pub parent_key: String,
    pub text_field: String,
}

#[derive(Debug)]
pub struct DeclaredResource {
    config: ResourceConfig,
    base_dir: PathBuf,
    http: Arc<HttpFetcher>,
    fragments_key: Vec<String>,
}

pub fn resource_from_config(
    config: ResourceConfig,
    base_dir: &Path,
    http: Arc<HttpFetcher>,
) -> Box<dyn Resource> {
    Box::new(DeclaredResource::new(config, base_dir, http))
}

impl DeclaredResource {
    pub fn new(config: ResourceConfig, base_dir: &Path, http: Arc<HttpFetcher>) -> Self {
        let fragments_key = if config.fragments.is_some() {
            vec!["parent_id".to_string(), "position".to_string()]
        } else {
            Vec::new()
        };
        Self {
            config,
            base_dir: base_dir.to_path_buf(),
            http,
            fragments_key,
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    async fn read_json_file(&self, path: &Path) -> ProducerResult<RecordBatch> {
        let path = self.base_dir.join(path);
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let batch = parse_json_records(&text).with_context(|| format!("parsing {}", path.display()))?;
        debug!(resource = %self.config.name, records = batch.len(), path = %path.display(), "read json file");
        Ok(batch)
    }

    async fn fetch_urls(
        &self,
        urls: &[String],
        records_pointer: Option<&str>,
    ) -> ProducerResult<RecordBatch> {
        let bodies = try_join_all(
            urls.iter()
                .map(|url| self.http.fetch_json(&self.config.name, url)),
        )
        .await?;

        let mut batch = Vec::new();
        for (url, body) in urls.iter().zip(bodies) {
            let body = match records_pointer {
                Some(pointer) => body
                    .pointer(pointer)
                    .cloned()
                    .with_context(|| format!("{url}: nothing at {pointer}"))?,
                None => body,
            };
            batch.extend(records_from_value(body).with_context(|| format!("decoding {url}"))?);
        }
        debug!(resource = %self.config.name, urls = urls.len(), records = batch.len(), "fetched urls");
        Ok(batch)
    }
}

impl Resource for DeclaredResource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn natural_key(&self) -> &[String] {
        &self.config.natural_key
    }

    fn fetch_data<'a>(
        &'a self,
        _existing: Option<&'a TableHandle>,
    ) -> Task<'a, ProducerResult<RecordBatch>> {
        match &self.config.source {
            SourceConfig::JsonFile { path } => Task::pending(self.read_json_file(path)),
            SourceConfig::HttpJson {
                urls,
                records_pointer,
            } => Task::pending(self.fetch_urls(urls, records_pointer.as_deref())),
        }
    }

    fn fetch_fragments<'a>(
        &'a self,
        _existing: Option<&'a TableHandle>,
        context: Option<Arc<RecordBatch>>,
    ) -> Option<Task<'a, ProducerResult<RecordBatch>>> {
        let config = self.config.fragments.as_ref()?;
        let fragments = match context {
            Some(batch) => fragment_records(&batch, config),
            None => Ok(Vec::new()),
        };
        Some(Task::ready(fragments))
    }

    fn fragments_natural_key(&self) -> &[String] {
        &self.fragments_key
    }

    fn fragments_group_column(&self) -> Option<&str> {
        self.config.fragments.as_ref().map(|_| "parent_id")
    }
}

/// Accepts a JSON document (array of objects or one object) or NDJSON.
pub(crate) fn parse_json_records(text: &str) -> anyhow::Result<RecordBatch> {
    if let Ok(value) = serde_json::from_str::<JsonValue>(text) {
        return records_from_value(value);
    }
    let mut batch = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: JsonValue =
            serde_json::from_str(line).with_context(|| format!("line {}", index + 1))?;
        match value {
            JsonValue::Object(map) => batch.push(map),
            other => bail!("line {}: expected an object, found {}", index + 1, kind_name(&other)),
        }
    }
    Ok(batch)
}

pub(crate) fn records_from_value(value: JsonValue) -> anyhow::Result<RecordBatch> {
    match value {
        JsonValue::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                JsonValue::Object(map) => Ok(map),
                other => bail!("item {index}: expected an object, found {}", kind_name(&other)),
            })
            .collect(),
        JsonValue::Object(map) => Ok(vec![map]),
        other => bail!("expected an array or object, found {}", kind_name(&other)),
    }
}

fn kind_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Split on `.`, `!` or `?` when followed by whitespace or the end of text.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((index, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let at_boundary = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
        if at_boundary {
            let end = index + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

pub fn fragment_records(batch: &[Record], config: &FragmentConfig) -> anyhow::Result<RecordBatch> {
    let mut fragments = Vec::new();
    for record in batch {
        let parent = record
            .get(&config.parent_key)
            .filter(|value| !value.is_null())
            .with_context(|| format!("record has no '{}' value", config.parent_key))?;
        let text = match record.get(&config.text_field) {
            None | Some(JsonValue::Null) => continue,
            Some(JsonValue::String(text)) => text,
            Some(other) => bail!(
                "'{}' must be text, found {}",
                config.text_field,
                kind_name(other)
            ),
        };
        for (position, sentence) in split_sentences(text).into_iter().enumerate() {
            let mut row = Record::new();
            row.insert("parent_id".into(), parent.clone());
            row.insert("position".into(), json!(position));
            row.insert("text".into(), JsonValue::String(sentence));
            fragments.push(row);
        }
    }
    Ok(fragments)
}
