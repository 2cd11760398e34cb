//! Record inspection commands: `get`, `list`, and `members`.

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::collections::CollectionManager;
use crate::config::Config;
use crate::db;
use crate::models::{Record, RecordType, SourceKey};
use crate::records::{MissingReason, RecordManager, Resolution};
use crate::store::{RecordFilter, Store};

#[derive(Debug, Clone, Default)]
pub struct ListArgs {
    /// `type:identity`
    pub source: Option<String>,
    pub tag: Option<String>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

pub fn parse_source(source: &str) -> Result<SourceKey> {
    match source.split_once(':') {
        Some((source_type, identity)) if !source_type.is_empty() && !identity.is_empty() => {
            Ok(SourceKey::new(source_type, identity))
        }
        _ => bail!("source must be '<type>:<name>', got '{}'", source),
    }
}

impl ListArgs {
    pub fn filter(&self) -> Result<RecordFilter> {
        Ok(RecordFilter {
            source: self.source.as_deref().map(parse_source).transpose()?,
            tag: self.tag.clone(),
            include_deleted: self.include_deleted,
            limit: self.limit,
            ..Default::default()
        })
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let store = db::open_store(config).await?;
    let records = RecordManager::new(store.clone());

    let Some(record) = records.get(id).await? else {
        store.pool().close().await;
        bail!("record not found: {}", id);
    };

    println!("--- Record ---");
    println!("id:          {}", record.unique_id);
    println!("title:       {}", record.title);
    println!("type:        {}", record.record_type);
    println!("status:      {}", record.status);
    if let Some(p) = &record.provenance {
        println!("source:      {}", p.key());
        println!("external_id: {}", p.external_id);
        if let Some(ts) = p.source_modified_at {
            println!("source_time: {}", format_ts(ts));
        }
    }
    if let Some(collection) = record.collection() {
        println!("collection:  {}", collection);
    }
    if !record.tags.is_empty() {
        let tags: Vec<&str> = record.tags.iter().map(String::as_str).collect();
        println!("tags:        {}", tags.join(", "));
    }
    println!("created_at:  {}", format_ts(record.created_at));
    println!("updated_at:  {}", format_ts(record.updated_at));
    println!("revision:    {}", record.revision);
    println!(
        "embedding:   {}",
        record
            .embedding
            .as_ref()
            .map(|v| format!("{} dims", v.len()))
            .unwrap_or_else(|| "none".to_string())
    );
    println!(
        "metadata:    {}",
        record.custom_metadata.to_json_object()
    );
    println!();

    println!("--- Text ---");
    println!("{}", record.text_content);
    println!();

    let edges = records.relationships(id).await?;
    println!("--- Relationships ({}) ---", edges.len());
    for resolved in &edges {
        let target = match &resolved.resolution {
            Resolution::Found(target) => target.title.clone(),
            Resolution::Missing(missing) => match missing.reason {
                MissingReason::Absent => "(missing)".to_string(),
                MissingReason::Tombstoned => "(deleted)".to_string(),
            },
        };
        println!(
            "{:<12} {} {}",
            resolved.edge.rel_type.to_string(),
            resolved.edge.target_unique_id,
            target
        );
    }

    if record.record_type == RecordType::CollectionHeader && !record.is_tombstoned() {
        let members = CollectionManager::new(records.clone())
            .list_members(id)
            .await?;
        println!();
        print_members(&members);
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_list(config: &Config, args: &ListArgs) -> Result<()> {
    let filter = args.filter()?;
    let store = db::open_store(config).await?;
    let records = store.scan(&filter).await?;

    println!("{:<38} {:<18} {:<10} TITLE", "ID", "TYPE", "STATUS");
    for record in &records {
        print_row(record);
    }
    println!("{} record(s)", records.len());

    store.pool().close().await;
    Ok(())
}

pub async fn run_members(config: &Config, header_id: &str) -> Result<()> {
    let store = db::open_store(config).await?;
    let collections = CollectionManager::new(RecordManager::new(store.clone()));
    let members = collections.list_members(header_id).await?;
    print_members(&members);
    store.pool().close().await;
    Ok(())
}

fn print_members(members: &[Record]) {
    println!("--- Members ({}) ---", members.len());
    for member in members {
        let position = member
            .member_of_edge()
            .and_then(|e| e.position)
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:>4}  {}  {}", position, member.unique_id, member.title);
    }
}

fn print_row(record: &Record) {
    println!(
        "{:<38} {:<18} {:<10} {}",
        record.unique_id,
        record.record_type.as_str(),
        record.status.as_str(),
        record.title
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_source() {
        let key = parse_source("filesystem:notes").unwrap();
        assert_eq!(key, SourceKey::new("filesystem", "notes"));
        assert!(parse_source("filesystem").is_err());
        assert!(parse_source(":notes").is_err());
    }

    #[test]
    fn test_list_args_build_filter() {
        let args = ListArgs {
            source: Some("filesystem:notes".into()),
            tag: Some("x".into()),
            include_deleted: true,
            limit: Some(3),
        };
        let filter = args.filter().unwrap();
        assert_eq!(filter.source, Some(SourceKey::new("filesystem", "notes")));
        assert!(filter.include_deleted);
        assert_eq!(filter.limit, Some(3));
    }
}
