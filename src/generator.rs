use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::article::{date_folder, write_article, write_index};
use crate::config::{NewsConfig, Section};
use crate::error::{AppError, Result};
use crate::llm::TextGenerator;
use crate::scheduler::BatchRunner;

/// Output of one section for one batch.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub id: String,
    pub name: String,
    pub reporter: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub articles: usize,
    pub folder: String,
    pub index_path: PathBuf,
}

pub fn effective_system_prompt(global: Option<&str>, section_prompt: &str) -> String {
    match global {
        Some(global) if !global.is_empty() => format!("{} {}", global, section_prompt),
        _ => section_prompt.to_string(),
    }
}

pub async fn generate_section(
    generator: &dyn TextGenerator,
    section: &Section,
    global_system_prompt: Option<&str>,
    cancel: &CancellationToken,
) -> Result<GenerationResult> {
    let system_prompt = effective_system_prompt(global_system_prompt, &section.system_prompt);
    debug!(section = %section.id, "generating section");

    let content = generator
        .generate(&system_prompt, &section.section_prompt, cancel)
        .await?;

    Ok(GenerationResult {
        id: section.id.clone(),
        name: section.name.clone(),
        reporter: section.reporter.clone(),
        content,
        timestamp: Utc::now(),
    })
}

/// Generates every configured section and publishes the results under
/// `public_root`.
pub struct BatchGenerator {
    generator: Arc<dyn TextGenerator>,
    config: Arc<NewsConfig>,
    public_root: PathBuf,
}

impl BatchGenerator {
    pub fn new(generator: Arc<dyn TextGenerator>, config: Arc<NewsConfig>, public_root: PathBuf) -> Self {
        Self {
            generator,
            config,
            public_root,
        }
    }

    pub async fn generate_all(&self, cancel: &CancellationToken) -> Result<BatchSummary> {
        let sections = &self.config.sections;
        let global = self.config.global_system_prompt();
        info!(sections = sections.len(), "generating batch");

        // First failure drops the remaining requests.
        let pending = sections
            .iter()
            .map(|section| generate_section(self.generator.as_ref(), section, global, cancel));
        let results = match try_join_all(pending).await {
            Ok(results) => results,
            Err(_) if cancel.is_cancelled() => return Err(AppError::Cancelled),
            Err(e) => return Err(e),
        };

        let folder = date_folder(&Utc::now());
        let index_path = publish(&self.public_root, &results, &folder, cancel).await?;

        info!(articles = results.len(), %folder, "batch published");
        Ok(BatchSummary {
            articles: results.len(),
            folder,
            index_path,
        })
    }
}

/// Writes every article, then the index. The token is checked before each
/// write.
pub async fn publish(
    public_root: &Path,
    results: &[GenerationResult],
    folder: &str,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let mut items = Vec::with_capacity(results.len());
    for result in results {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        items.push(write_article(public_root, result, folder).await?);
    }
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }
    write_index(public_root, items).await
}

#[async_trait]
impl BatchRunner for BatchGenerator {
    async fn run_batch(&self, cancel: CancellationToken) -> Result<BatchSummary> {
        self.generate_all(&cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every call; fails for prompts listed in `fail_on`, hangs until
    /// cancelled for prompts listed in `hang_on`.
    #[derive(Default)]
    struct FakeGenerator {
        calls: Mutex<Vec<(String, String)>>,
        fail_on: Vec<&'static str>,
        hang_on: Vec<&'static str>,
    }

    #[async_trait]
    impl TextGenerator for FakeGenerator {
        async fn generate(
            &self,
            system_prompt: &str,
            user_prompt: &str,
            cancel: &CancellationToken,
        ) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((system_prompt.to_string(), user_prompt.to_string()));
            if self.fail_on.iter().any(|p| *p == user_prompt) {
                return Err(AppError::UpstreamError {
                    status: 500,
                    status_text: "Internal Server Error".to_string(),
                });
            }
            if self.hang_on.iter().any(|p| *p == user_prompt) {
                cancel.cancelled().await;
                return Err(AppError::Cancelled);
            }
            Ok(format!("Report on {}", user_prompt))
        }
    }

    fn section(id: &str) -> Section {
        Section {
            id: id.to_string(),
            name: format!("{} desk", id),
            reporter: "Ada".to_string(),
            system_prompt: format!("Cover {}.", id),
            section_prompt: format!("{}-prompt", id),
        }
    }

    fn news_config(global: Option<&str>, ids: &[&str]) -> Arc<NewsConfig> {
        let json = serde_json::json!({
            "ollamaConfig": { "baseUrl": "http://localhost:11434", "model": "llama3" },
            "systemPrompt": global,
            "sections": ids.iter().map(|id| {
                let s = section(id);
                serde_json::json!({
                    "id": s.id, "name": s.name, "reporter": s.reporter,
                    "systemPrompt": s.system_prompt, "sectionPrompt": s.section_prompt,
                })
            }).collect::<Vec<_>>(),
        });
        Arc::new(NewsConfig::from_json(&json.to_string()).unwrap())
    }

    #[test]
    fn global_prompt_is_joined_with_a_single_space() {
        assert_eq!(effective_system_prompt(Some("Global."), "Local."), "Global. Local.");
        assert_eq!(effective_system_prompt(None, "Local."), "Local.");
        assert_eq!(effective_system_prompt(Some(""), "Local."), "Local.");
    }

    #[tokio::test]
    async fn section_result_copies_identity() {
        let fake = FakeGenerator::default();
        let result = generate_section(&fake, &section("world"), Some("Be calm."), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.id, "world");
        assert_eq!(result.name, "world desk");
        assert_eq!(result.content, "Report on world-prompt");
        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls[0], ("Be calm. Cover world.".to_string(), "world-prompt".to_string()));
    }

    #[tokio::test]
    async fn section_failure_propagates_unchanged() {
        let fake = FakeGenerator {
            fail_on: vec!["world-prompt"],
            ..Default::default()
        };
        let err = generate_section(&fake, &section("world"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UpstreamError { status: 500, .. }));
    }

    #[tokio::test]
    async fn successful_batch_writes_one_article_per_section_and_one_index() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGenerator::default());
        let ids = ["world", "sports", "tech"];
        let batch = BatchGenerator::new(fake.clone(), news_config(Some("Global."), &ids), dir.path().to_path_buf());

        let summary = batch.generate_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.articles, 3);

        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&summary.index_path).unwrap()).unwrap();
        let mut indexed: Vec<String> = index["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["id"].as_str().unwrap().to_string())
            .collect();
        indexed.sort();
        assert_eq!(indexed, vec!["sports", "tech", "world"]);

        for id in ids {
            let article = dir.path().join(format!("sections/{}/{}.html", id, summary.folder));
            assert!(article.exists(), "missing {}", article.display());
        }

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(system, _)| system.starts_with("Global. Cover ")));
    }

    #[tokio::test]
    async fn any_section_failure_skips_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGenerator {
            fail_on: vec!["sports-prompt"],
            ..Default::default()
        });
        let batch = BatchGenerator::new(fake, news_config(None, &["world", "sports"]), dir.path().to_path_buf());

        let err = batch.generate_all(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AppError::UpstreamError { .. }));
        assert!(!dir.path().join("news.json").exists());
    }

    fn result(id: String) -> GenerationResult {
        GenerationResult {
            name: id.clone(),
            reporter: "Ada".to_string(),
            content: "Body".to_string(),
            timestamp: Utc::now(),
            id,
        }
    }

    #[tokio::test]
    async fn publish_with_fired_token_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = vec![result("world".to_string())];
        let err = publish(dir.path(), &results, "2024-03-14_01-00", &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(!dir.path().join("sections").exists());
        assert!(!dir.path().join("news.json").exists());
    }

    #[tokio::test]
    async fn cancellation_during_writes_stops_before_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let results: Vec<_> = (0..20).map(|i| result(format!("desk-{i}"))).collect();
        let cancel = CancellationToken::new();

        // Cancel as soon as the first article shows up on disk.
        let watched = dir.path().join("sections");
        let trigger = cancel.clone();
        let watcher = tokio::spawn(async move {
            while !std::fs::read_dir(&watched).is_ok_and(|mut entries| entries.next().is_some()) {
                tokio::task::yield_now().await;
            }
            trigger.cancel();
        });

        let err = publish(dir.path(), &results, "2024-03-14_01-00", &cancel).await.unwrap_err();
        watcher.await.unwrap();

        assert!(err.is_cancelled());
        assert!(!dir.path().join("news.json").exists());
        let written = std::fs::read_dir(dir.path().join("sections")).unwrap().count();
        assert!(written < results.len(), "wrote {written} articles after cancellation");
    }

    #[tokio::test]
    async fn cancelled_batch_reports_cancelled_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGenerator {
            hang_on: vec!["world-prompt"],
            ..Default::default()
        });
        let batch = BatchGenerator::new(fake, news_config(None, &["world", "sports"]), dir.path().to_path_buf());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = batch.generate_all(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(!dir.path().join("news.json").exists());
        assert!(!dir.path().join("sections").exists());
    }
}
