//! [`Component`] implementations for the fetcher, converter, retriever and generator.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use webrag_converter::HtmlToDocument;
use webrag_fetcher::LinkContentFetcher;
use webrag_llm::ChatGenerator;
use webrag_shared::Result;
use webrag_store::DocumentStore;

use crate::component::{Component, Inputs, Outputs, Port, Value, ValueKind};

#[async_trait]
impl Component for LinkContentFetcher {
    fn inputs(&self) -> Vec<Port> {
        vec![Port::required("urls", ValueKind::Urls)]
    }

    fn outputs(&self) -> Vec<Port> {
        vec![
            Port::required("streams", ValueKind::Streams),
            Port::required("failures", ValueKind::Failures),
        ]
    }

    async fn run(&self, mut inputs: Inputs) -> Result<Outputs> {
        let urls = inputs.urls("urls")?;
        let batch = self.fetch(&urls).await?;
        Ok(Outputs::from([
            ("streams".to_string(), Value::Streams(batch.streams)),
            ("failures".to_string(), Value::Failures(batch.failures)),
        ]))
    }
}

#[async_trait]
impl Component for HtmlToDocument {
    fn inputs(&self) -> Vec<Port> {
        vec![Port::required("streams", ValueKind::Streams)]
    }

    fn outputs(&self) -> Vec<Port> {
        vec![Port::required("documents", ValueKind::Documents)]
    }

    async fn run(&self, mut inputs: Inputs) -> Result<Outputs> {
        let streams = inputs.streams("streams")?;
        let documents = HtmlToDocument::run(self, &streams);
        Ok(Outputs::from([(
            "documents".to_string(),
            Value::Documents(documents),
        )]))
    }
}

#[async_trait]
impl Component for ChatGenerator {
    fn inputs(&self) -> Vec<Port> {
        vec![Port::required("prompt", ValueKind::Text)]
    }

    fn outputs(&self) -> Vec<Port> {
        vec![
            Port::required("replies", ValueKind::Replies),
            Port::required("meta", ValueKind::ReplyMeta),
        ]
    }

    async fn run(&self, mut inputs: Inputs) -> Result<Outputs> {
        let prompt = inputs.text("prompt")?;
        let result = self.generate(&prompt).await?;
        Ok(Outputs::from([
            ("replies".to_string(), Value::Replies(result.replies)),
            ("meta".to_string(), Value::ReplyMeta(result.meta)),
        ]))
    }
}

// ---------------------------------------------------------------------------
// Bm25Retriever
// ---------------------------------------------------------------------------

/// Keyword retriever over a populated [`DocumentStore`].
pub struct Bm25Retriever {
    store: Arc<dyn DocumentStore>,
    top_k: usize,
}

impl Bm25Retriever {
    /// `top_k` is used unless the run supplies its own `top_k` input.
    pub fn new(store: Arc<dyn DocumentStore>, top_k: usize) -> Self {
        Self { store, top_k }
    }
}

#[async_trait]
impl Component for Bm25Retriever {
    fn inputs(&self) -> Vec<Port> {
        vec![
            Port::required("query", ValueKind::Text),
            Port::optional("top_k", ValueKind::Count),
        ]
    }

    fn outputs(&self) -> Vec<Port> {
        vec![Port::required("documents", ValueKind::Documents)]
    }

    #[instrument(skip_all, name = "retrieve")]
    async fn run(&self, mut inputs: Inputs) -> Result<Outputs> {
        let query = inputs.text("query")?;
        let top_k = inputs.opt_count("top_k")?.unwrap_or(self.top_k);

        let documents = self.store.search(&query, top_k);
        debug!(top_k, returned = documents.len(), "documents retrieved");

        Ok(Outputs::from([(
            "documents".to_string(),
            Value::Documents(documents),
        )]))
    }
}
