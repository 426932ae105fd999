//! On-disk layout of generated content: one HTML article per section per
//! batch, plus the `news.json` index pointing at the latest of each.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;

use crate::error::{AppError, Result};
use crate::generator::GenerationResult;

pub const INDEX_FILE: &str = "news.json";
pub const SECTIONS_DIR: &str = "sections";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewsIndexEntry {
    pub id: String,
    pub name: String,
    pub reporter: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct NewsIndex {
    pub items: Vec<NewsIndexEntry>,
    pub generated: DateTime<Utc>,
}

/// Storage key for a batch: `YYYY-MM-DD_HH-MM`, free of `:` and `.`.
pub fn date_folder(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d_%H-%M").to_string()
}

/// Article path relative to the public root.
pub fn article_url(section_id: &str, folder: &str) -> String {
    format!("{}/{}/{}.html", SECTIONS_DIR, section_id, folder)
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn render_article(result: &GenerationResult) -> String {
    let name = escape_html(&result.name);
    let reporter = escape_html(&result.reporter);
    let when = result.timestamp.format("%B %-d, %Y %H:%M UTC");

    let mut body = String::with_capacity(result.content.len() + 64);
    for paragraph in result.content.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        body.push_str("    <p>");
        body.push_str(&escape_html(paragraph).replace('\n', "<br>\n"));
        body.push_str("</p>\n");
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>{name}</title>
  <link rel="stylesheet" href="/styles.css">
</head>
<body>
  <article>
    <h1>{name}</h1>
    <p class="byline">By {reporter} &middot; <time datetime="{iso}">{when}</time></p>
{body}  </article>
</body>
</html>
"#,
        iso = result.timestamp.to_rfc3339(),
    )
}

/// Writes one article and returns its index entry.
pub async fn write_article(
    public_root: &Path,
    result: &GenerationResult,
    folder: &str,
) -> Result<NewsIndexEntry> {
    let url = article_url(&result.id, folder);
    let path = public_root.join(&url);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            AppError::StorageError(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }
    fs::write(&path, render_article(result)).await.map_err(|e| {
        AppError::StorageError(format!("Failed to write {}: {}", path.display(), e))
    })?;

    Ok(NewsIndexEntry {
        id: result.id.clone(),
        name: result.name.clone(),
        reporter: result.reporter.clone(),
        url,
        timestamp: result.timestamp,
    })
}

/// Replaces the index file. The new content goes to a temporary sibling first
/// so readers never see a half-written index.
pub async fn write_index(public_root: &Path, items: Vec<NewsIndexEntry>) -> Result<PathBuf> {
    let index = NewsIndex {
        items,
        generated: Utc::now(),
    };
    let serialized = serde_json::to_vec_pretty(&index)?;

    fs::create_dir_all(public_root).await?;
    let path = public_root.join(INDEX_FILE);
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, &serialized).await.map_err(|e| {
        AppError::StorageError(format!("Failed to write {}: {}", temp_path.display(), e))
    })?;
    if let Err(e) = fs::rename(&temp_path, &path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(AppError::StorageError(format!(
            "Failed to replace {}: {}",
            path.display(),
            e
        )));
    }
    Ok(path)
}
