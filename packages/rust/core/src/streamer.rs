//! Grounded answer streaming.
//!
//! Builds the grounding prompt from retrieved chunks, streams the model's
//! answer through a bounded channel as [`Fragment`]s, and finishes with a
//! best-effort source-image pass: URLs mentioned in the answer are checked
//! against the crawl rules and resolved against stored documents.

use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use concierge_policy::RuleSet;
use concierge_storage::Storage;

use crate::generate::Generator;
use crate::retriever::{RetrievedChunk, Retriever};

/// Channel capacity for answer fragments.
const FRAGMENT_BUFFER: usize = 32;

/// System prompt keeping the model grounded in the retrieved sources.
const SYSTEM_PROMPT: &str = "You are a helpful assistant that answers questions using only the \
provided sources. Cite the URL of each source you rely on. If the sources do not contain the \
answer, say you do not know rather than guessing.";

/// An image resolved for a URL the answer mentioned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceImage {
    pub url: String,
    pub image_url: String,
    pub title: Option<String>,
}

/// One piece of a streamed answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// A span of answer text.
    Delta(String),
    /// Images for sources cited in the answer; sent once, after the text.
    Sources(Vec<SourceImage>),
    /// Generation failed; always the last fragment when present.
    Error(String),
    /// The stream finished normally.
    Done,
}

/// Streams grounded answers for user questions.
pub struct AnswerStreamer {
    retriever: Arc<Retriever>,
    generator: Arc<dyn Generator>,
    storage: Arc<Storage>,
    rules: RuleSet,
}

impl AnswerStreamer {
    pub fn new(
        retriever: Arc<Retriever>,
        generator: Arc<dyn Generator>,
        storage: Arc<Storage>,
        rules: RuleSet,
    ) -> Self {
        Self {
            retriever,
            generator,
            storage,
            rules,
        }
    }

    /// Answer `question`, streaming fragments to the returned receiver.
    /// Dropping the receiver cancels generation.
    pub fn answer(self: &Arc<Self>, question: String) -> mpsc::Receiver<Fragment> {
        let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
        let this = self.clone();
        tokio::spawn(async move {
            this.run(question, tx).await;
        });
        rx
    }

    async fn run(&self, question: String, tx: mpsc::Sender<Fragment>) {
        let sources = self.retriever.retrieve(&question).await;
        let user_payload = build_user_payload(&question, &sources);

        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(FRAGMENT_BUFFER);
        let generator = self.generator.clone();
        let generation = tokio::spawn(async move {
            generator
                .stream_chat(SYSTEM_PROMPT, &user_payload, delta_tx)
                .await
        });

        let mut answer = String::new();
        while let Some(delta) = delta_rx.recv().await {
            answer.push_str(&delta);
            if tx.send(Fragment::Delta(delta)).await.is_err() {
                // Listener left; dropping delta_rx cancels the generator.
                debug!("answer receiver dropped, cancelling generation");
                return;
            }
        }

        match generation.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "generation failed");
                let _ = tx.send(Fragment::Error(e.to_string())).await;
                return;
            }
            Err(e) => {
                let _ = tx.send(Fragment::Error(format!("generation task failed: {e}"))).await;
                return;
            }
        }

        let images = self.source_images(&answer).await;
        if !images.is_empty() {
            let _ = tx.send(Fragment::Sources(images)).await;
        }
        let _ = tx.send(Fragment::Done).await;
    }

    /// Best-effort: URLs in the answer, filtered by the crawl rules and
    /// resolved against stored documents. Failures yield no images.
    async fn source_images(&self, answer: &str) -> Vec<SourceImage> {
        let urls = extract_urls(answer);
        let permitted: Vec<String> = urls
            .into_iter()
            .filter(|u| self.rules.permits(u))
            .collect();
        if permitted.is_empty() {
            return Vec::new();
        }

        match self.storage.get_images_for_urls(&permitted).await {
            Ok(rows) => rows
                .into_iter()
                .map(|(url, image_url, title)| SourceImage {
                    url,
                    image_url,
                    title,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "source image lookup failed");
                Vec::new()
            }
        }
    }
}

/// Build the JSON user payload with numbered sources.
fn build_user_payload(question: &str, sources: &[RetrievedChunk]) -> String {
    let sources_json: Vec<_> = sources
        .iter()
        .enumerate()
        .map(|(i, s)| {
            json!({
                "id": i + 1,
                "url": s.chunk.source_url,
                "title": s.title,
                "published_date": s.published_date,
                "text": s.chunk.text,
            })
        })
        .collect();

    json!({ "question": question, "sources": sources_json }).to_string()
}

/// URL-like substrings in the answer text, deduplicated in order.
fn extract_urls(text: &str) -> Vec<String> {
    let re = Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("valid regex");
    let mut seen = std::collections::HashSet::new();
    re.find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':']).to_string())
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use concierge_index::{Embedder, VectorIndex};
    use concierge_shared::{ConciergeError, PageRecord, PageState, Result};
    use tokio::sync::RwLock;
    use uuid::Uuid;

    struct ScriptedGenerator {
        deltas: Vec<&'static str>,
        fail: bool,
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn stream_chat(
            &self,
            _system: &str,
            _user: &str,
            tx: mpsc::Sender<String>,
        ) -> Result<()> {
            for delta in &self.deltas {
                if tx.send(delta.to_string()).await.is_err() {
                    return Ok(());
                }
            }
            if self.fail {
                return Err(ConciergeError::Generation("model unavailable".into()));
            }
            Ok(())
        }
    }

    struct NullEmbedder;

    #[async_trait]
    impl Embedder for NullEmbedder {
        async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(inputs.iter().map(|_| vec![1.0f32, 0.0]).collect())
        }
    }

    async fn streamer_with(
        deltas: Vec<&'static str>,
        fail: bool,
        deny_patterns: &[&str],
    ) -> (Arc<AnswerStreamer>, Arc<Storage>) {
        let tmp = std::env::temp_dir().join(format!("concierge_stream_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp).await.expect("open db"));
        let index = Arc::new(RwLock::new(VectorIndex::new()));
        let retriever = Arc::new(Retriever::new(
            Arc::new(NullEmbedder),
            index,
            storage.clone(),
            8,
        ));
        let deny: Vec<String> = deny_patterns.iter().map(|s| s.to_string()).collect();
        let rules = RuleSet::compile(&[], &deny).unwrap();

        let streamer = Arc::new(AnswerStreamer::new(
            retriever,
            Arc::new(ScriptedGenerator { deltas, fail }),
            storage.clone(),
            rules,
        ));
        (streamer, storage)
    }

    async fn collect(mut rx: mpsc::Receiver<Fragment>) -> Vec<Fragment> {
        let mut fragments = Vec::new();
        while let Some(fragment) = rx.recv().await {
            fragments.push(fragment);
        }
        fragments
    }

    #[tokio::test]
    async fn streams_deltas_then_done() {
        let (streamer, _storage) =
            streamer_with(vec!["The stew ", "simmers."], false, &[]).await;
        let fragments = collect(streamer.answer("how long?".into())).await;

        assert_eq!(
            fragments,
            vec![
                Fragment::Delta("The stew ".into()),
                Fragment::Delta("simmers.".into()),
                Fragment::Done,
            ]
        );
    }

    #[tokio::test]
    async fn cited_sources_get_images() {
        let (streamer, storage) = streamer_with(
            vec!["See https://example.com/stew for the recipe."],
            false,
            &[],
        )
        .await;

        storage
            .upsert_document(&PageRecord {
                id: Uuid::now_v7().to_string(),
                url: "https://example.com/stew".into(),
                title: Some("Stew".into()),
                content_hash: "h".into(),
                fetched_at: Utc::now(),
                status_code: Some(200),
                chunk_count: 1,
                image_url: Some("https://example.com/stew.jpg".into()),
                published_date: None,
                state: PageState::Indexed,
            })
            .await
            .unwrap();

        let fragments = collect(streamer.answer("recipe?".into())).await;
        let sources = fragments.iter().find_map(|f| match f {
            Fragment::Sources(s) => Some(s.clone()),
            _ => None,
        });

        let sources = sources.expect("sources fragment");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].image_url, "https://example.com/stew.jpg");
        assert_eq!(fragments.last(), Some(&Fragment::Done));
    }

    #[tokio::test]
    async fn denied_urls_are_not_resolved() {
        let (streamer, storage) = streamer_with(
            vec!["See https://example.com/archive/old today."],
            false,
            &["*/archive/*"],
        )
        .await;

        storage
            .upsert_document(&PageRecord {
                id: Uuid::now_v7().to_string(),
                url: "https://example.com/archive/old".into(),
                title: None,
                content_hash: "h".into(),
                fetched_at: Utc::now(),
                status_code: Some(200),
                chunk_count: 1,
                image_url: Some("https://example.com/old.jpg".into()),
                published_date: None,
                state: PageState::Indexed,
            })
            .await
            .unwrap();

        let fragments = collect(streamer.answer("old stuff?".into())).await;
        assert!(
            !fragments
                .iter()
                .any(|f| matches!(f, Fragment::Sources(_)))
        );
        assert_eq!(fragments.last(), Some(&Fragment::Done));
    }

    #[tokio::test]
    async fn generation_failure_ends_with_error_fragment() {
        let (streamer, _storage) = streamer_with(vec!["partial "], true, &[]).await;
        let fragments = collect(streamer.answer("q".into())).await;

        assert_eq!(fragments[0], Fragment::Delta("partial ".into()));
        assert!(matches!(fragments.last(), Some(Fragment::Error(_))));
    }

    #[tokio::test]
    async fn dropping_the_receiver_cancels() {
        let (streamer, _storage) =
            streamer_with(vec!["a", "b", "c", "d"], false, &[]).await;
        let mut rx = streamer.answer("q".into());
        assert!(rx.recv().await.is_some());
        drop(rx);
        // Nothing to assert beyond not hanging; give the task a beat to exit.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[test]
    fn url_extraction_trims_punctuation_and_dedupes() {
        let urls = extract_urls(
            "Read https://a.net/x, then https://a.net/x and (https://b.org/y).",
        );
        assert_eq!(urls, vec!["https://a.net/x", "https://b.org/y"]);
    }
}
