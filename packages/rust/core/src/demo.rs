//! The two question-answering pipelines.
//!
//! - Web QA: `fetcher → converter → prompt_builder → llm`
//! - RAG QA: `retriever → prompt_builder → llm`, over a populated [`DocumentStore`]

use std::sync::Arc;

use serde_json::Value as Json;
use url::Url;

use webrag_converter::HtmlToDocument;
use webrag_fetcher::LinkContentFetcher;
use webrag_llm::{ChatGenerator, GeneratorOptions};
use webrag_shared::{AppConfig, Credential, Document, Metadata, Result};
use webrag_store::{Bm25Params, DocumentStore, DuplicatePolicy, InMemoryDocumentStore};

use crate::component::Value;
use crate::pipeline::{Pipeline, PipelineInputs, PipelineOutput};
use crate::prompt::PromptBuilder;
use crate::stages::Bm25Retriever;

pub const FETCHER: &str = "fetcher";
pub const CONVERTER: &str = "converter";
pub const RETRIEVER: &str = "retriever";
pub const PROMPT_BUILDER: &str = "prompt_builder";
pub const LLM: &str = "llm";

pub const WEB_QA_TEMPLATE: &str = "\
According to the contents of this website:
{% for document in documents %}
{{ document.content }}
{% endfor %}
Answer the given question: {{ query }}
Answer:
";

pub const RAG_TEMPLATE: &str = "\
Given the following information, answer the question.

Context:
{% for document in documents %}
    {{ document.content }}
{% endfor %}

Question: {{ query }}
Answer:
";

// ---------------------------------------------------------------------------
// Sample data
// ---------------------------------------------------------------------------

/// The built-in documents the RAG pipeline answers from.
pub fn sample_documents() -> Vec<Document> {
    let doc = |topic: &str, content: &str| {
        let meta: Metadata = [("topic".to_string(), Json::from(topic))].into();
        Document::new(content, meta)
    };
    vec![
        doc(
            "function-calling",
            "The Function-Calling API enables dynamic, agentic workflows by allowing the model \
             to suggest and select function calls based on user input. This feature facilitates \
             flexible agentic workflows that adapt to varied needs.",
        ),
        doc(
            "inference",
            "Interact with multimodal models directly through the Inference API (OpenAI \
             compatible) and Playground for seamless text and image processing.",
        ),
        doc(
            "samples",
            "New Python and Gradio code samples make it easier to build and deploy \
             applications. These examples support integrating AI models, enabling rapid \
             prototyping and reducing setup time.",
        ),
    ]
}

/// An in-memory store holding [`sample_documents`].
pub fn sample_store(params: Bm25Params) -> Result<InMemoryDocumentStore> {
    let mut store = InMemoryDocumentStore::new(params);
    store.write_documents(sample_documents(), DuplicatePolicy::Overwrite)?;
    Ok(store)
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

fn generator(config: &AppConfig, credential: Credential) -> Result<ChatGenerator> {
    ChatGenerator::new(GeneratorOptions::from(&config.llm), credential)
}

/// Build the web QA pipeline.
pub fn build_web_qa_pipeline(config: &AppConfig, credential: Credential) -> Result<Pipeline> {
    let mut pipeline = Pipeline::new();
    pipeline.add_stage(FETCHER, LinkContentFetcher::new(config.fetch.clone())?)?;
    pipeline.add_stage(CONVERTER, HtmlToDocument::new(&config.converter))?;
    pipeline.add_stage(PROMPT_BUILDER, PromptBuilder::new(WEB_QA_TEMPLATE)?)?;
    pipeline.add_stage(LLM, generator(config, credential)?)?;

    pipeline.connect("fetcher.streams", "converter.streams")?;
    pipeline.connect("converter.documents", "prompt_builder.documents")?;
    pipeline.connect("prompt_builder.prompt", "llm.prompt")?;
    Ok(pipeline)
}

/// Initial inputs for [`build_web_qa_pipeline`].
pub fn web_qa_inputs(urls: Vec<Url>, question: &str) -> PipelineInputs {
    PipelineInputs::new()
        .with(FETCHER, "urls", Value::Urls(urls))
        .with(PROMPT_BUILDER, "query", Value::Text(question.to_string()))
}

/// Build the RAG pipeline over `store`.
pub fn build_rag_pipeline(
    config: &AppConfig,
    store: Arc<dyn DocumentStore>,
    credential: Credential,
) -> Result<Pipeline> {
    let mut pipeline = Pipeline::new();
    pipeline.add_stage(RETRIEVER, Bm25Retriever::new(store, config.retrieval.top_k))?;
    pipeline.add_stage(PROMPT_BUILDER, PromptBuilder::new(RAG_TEMPLATE)?)?;
    pipeline.add_stage(LLM, generator(config, credential)?)?;

    pipeline.connect("retriever.documents", "prompt_builder.documents")?;
    pipeline.connect("prompt_builder.prompt", "llm.prompt")?;
    Ok(pipeline)
}

/// Initial inputs for [`build_rag_pipeline`]; `top_k` overrides the configured value.
pub fn rag_inputs(question: &str, top_k: Option<usize>) -> PipelineInputs {
    let inputs = PipelineInputs::new()
        .with(RETRIEVER, "query", Value::Text(question.to_string()))
        .with(PROMPT_BUILDER, "query", Value::Text(question.to_string()));
    match top_k {
        Some(k) => inputs.with(RETRIEVER, "top_k", Value::Count(k)),
        None => inputs,
    }
}

/// The canonical answer of a finished run.
pub fn answer(output: &PipelineOutput) -> Option<&str> {
    output
        .get(LLM, "replies")
        .and_then(Value::as_replies)
        .and_then(|replies| replies.first())
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentObserver;
    use webrag_shared::{LlmConfig, RagError, load_credential};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> AppConfig {
        let mut config = AppConfig::default();
        config.llm.base_url = format!("{}/v1", server.uri());
        config.llm.timeout_secs = 5;
        config.fetch.allow_private_hosts = true;
        config.fetch.timeout_secs = 5;
        config
    }

    fn credential() -> Credential {
        Credential::new("test-key").unwrap()
    }

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "model": "Meta-Llama-3.1-8B-Instruct",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 40, "completion_tokens": 20, "total_tokens": 60 }
        })
    }

    #[test]
    fn sample_query_ranks_api_documents_first() {
        let store = sample_store(Bm25Params::default()).unwrap();
        let results = store.search("Functionalities of Sambanova API?", 2);
        let topics: Vec<&str> = results
            .iter()
            .filter_map(|d| d.meta().get("topic").and_then(Json::as_str))
            .collect();
        assert!(topics.contains(&"function-calling"));
        assert!(topics.contains(&"inference"));
    }

    #[test]
    fn templates_parse() {
        for template in [WEB_QA_TEMPLATE, RAG_TEMPLATE] {
            let builder = PromptBuilder::new(template).unwrap();
            assert!(builder.variables().contains("query"));
            assert!(builder.variables().contains("documents"));
        }
    }

    #[tokio::test]
    async fn rag_pipeline_answers_from_retrieved_documents() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_string_contains("Function-Calling API"))
            .and(body_string_contains("Inference API"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                "SambaNova offers the Function-Calling API and the Inference API.",
            )))
            .expect(1)
            .mount(&server)
            .await;

        let config = config(&server);
        let store = Arc::new(sample_store(Bm25Params::from(&config.retrieval)).unwrap());
        let pipeline = build_rag_pipeline(&config, store, credential()).unwrap();

        let output = pipeline
            .run(
                rag_inputs("Functionalities of Sambanova API?", None),
                &SilentObserver,
            )
            .await
            .unwrap();

        let reply = answer(&output).unwrap();
        assert!(reply.contains("Function-Calling") || reply.contains("Inference API"));

        let retrieved = output
            .get(RETRIEVER, "documents")
            .and_then(Value::as_documents)
            .unwrap();
        assert_eq!(retrieved.len(), 3);
        assert!(retrieved.iter().all(|d| d.score().is_some()));
    }

    #[tokio::test]
    async fn web_qa_skips_missing_page_and_answers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/docs"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<html><head><title>Docs</title></head><body><main>\
                 <h1>Cloud Docs</h1><p>The Function-Calling API returns tool calls.</p>\
                 </main></body></html>",
                "text/html",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_string_contains("returns tool calls"))
            .and(body_string_contains("What does it return?"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion("The Function-Calling API returns tool calls.")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let pipeline = build_web_qa_pipeline(&config(&server), credential()).unwrap();
        let missing = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let docs = Url::parse(&format!("{}/docs", server.uri())).unwrap();

        let output = pipeline
            .run(
                web_qa_inputs(vec![missing.clone(), docs], "What does it return?"),
                &SilentObserver,
            )
            .await
            .unwrap();

        let failures = output
            .get(FETCHER, "failures")
            .and_then(Value::as_failures)
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].url, missing.to_string());

        let documents = output
            .get(CONVERTER, "documents")
            .and_then(Value::as_documents)
            .unwrap();
        assert_eq!(documents.len(), 1);
        assert!(!documents[0].is_empty());

        assert!(answer(&output).unwrap().contains("Function-Calling"));
    }

    #[tokio::test]
    async fn non_html_page_becomes_empty_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data.json"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{\"a\":1}", "application/json"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("No idea.")))
            .mount(&server)
            .await;

        let pipeline = build_web_qa_pipeline(&config(&server), credential()).unwrap();
        let url = Url::parse(&format!("{}/data.json", server.uri())).unwrap();
        let output = pipeline
            .run(web_qa_inputs(vec![url], "Anything?"), &SilentObserver)
            .await
            .unwrap();

        let documents = output
            .get(CONVERTER, "documents")
            .and_then(Value::as_documents)
            .unwrap();
        assert_eq!(documents.len(), 1);
        assert!(documents[0].is_empty());
    }

    #[tokio::test]
    async fn generation_failure_names_the_llm_stage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let config = config(&server);
        let store = Arc::new(sample_store(Bm25Params::default()).unwrap());
        let pipeline = build_rag_pipeline(&config, store, credential()).unwrap();

        let err = pipeline
            .run(rag_inputs("anything", Some(1)), &SilentObserver)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(LLM));
        assert!(matches!(err.root(), RagError::Generation(_)));
    }

    #[tokio::test]
    async fn missing_credential_fails_before_any_request() {
        let server = MockServer::start().await;
        let mut config = config(&server);
        config.llm = LlmConfig {
            api_key_env: "WEBRAG_TEST_UNSET_API_KEY_9f3c".into(),
            ..config.llm
        };

        let err = load_credential(&config.llm)
            .and_then(|credential| build_web_qa_pipeline(&config, credential))
            .err()
            .unwrap();

        assert!(matches!(err, RagError::Configuration { .. }));
        let requests = server.received_requests().await.unwrap_or_default();
        assert!(requests.is_empty());
    }
}
