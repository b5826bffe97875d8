//! Prompt templating.
//!
//! Templates use a small Jinja-like syntax bound to a typed [`PromptContext`]:
//!
//! ```text
//! {% for doc in documents %}
//! {{ doc.content }} ({{ doc.meta.url }})
//! {% endfor %}
//! Question: {{ query }}
//! ```
//!
//! Expressions are `query`, or `<var>.content`, `<var>.id`, `<var>.score` and
//! `<var>.meta.<key>` inside a loop over `documents`. A newline directly after
//! a `{% ... %}` tag is dropped. Templates are parsed and checked once, when
//! the [`PromptBuilder`] is built; a metadata key or score missing from a
//! document is a [`RagError::Template`] at render time.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value as Json;
use tracing::debug;

use webrag_shared::{Document, RagError, Result};

use crate::component::{Component, Inputs, Outputs, Port, Value, ValueKind};

/// Variables a template may reference.
pub const QUERY_VAR: &str = "query";
pub const DOCUMENTS_VAR: &str = "documents";

/// Everything a template can see.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub documents: &'a [Document],
    pub query: &'a str,
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum DocField {
    Id,
    Content,
    Score,
    Meta(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Query,
    DocField(DocField),
    ForDocuments(Vec<Node>),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{\{(?P<expr>.*?)\}\}|\{%(?P<stmt>.*?)%\}\n?").expect("valid regex")
});

enum Token<'a> {
    Text(&'a str),
    Expr(&'a str),
    Stmt(&'a str),
}

fn lex(template: &str) -> Result<Vec<Token<'_>>> {
    let mut tokens = Vec::new();
    let mut last = 0;
    for caps in TAG_RE.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        push_text(&mut tokens, &template[last..whole.start()])?;
        if let Some(expr) = caps.name("expr") {
            tokens.push(Token::Expr(expr.as_str().trim()));
        } else if let Some(stmt) = caps.name("stmt") {
            tokens.push(Token::Stmt(stmt.as_str().trim()));
        }
        last = whole.end();
    }
    push_text(&mut tokens, &template[last..])?;
    Ok(tokens)
}

fn push_text<'a>(tokens: &mut Vec<Token<'a>>, text: &'a str) -> Result<()> {
    if text.contains("{{") || text.contains("{%") {
        return Err(RagError::template("unclosed '{{' or '{%' tag"));
    }
    if !text.is_empty() {
        tokens.push(Token::Text(text));
    }
    Ok(())
}

struct Parser<'a> {
    tokens: std::vec::IntoIter<Token<'a>>,
    variables: BTreeSet<&'static str>,
}

impl<'a> Parser<'a> {
    /// Parse nodes until `{% endfor %}` (inside a loop) or end of input.
    fn parse_block(&mut self, loop_var: Option<&str>) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        while let Some(token) = self.tokens.next() {
            match token {
                Token::Text(t) => nodes.push(Node::Text(t.to_string())),
                Token::Expr(e) => nodes.push(self.parse_expr(e, loop_var)?),
                Token::Stmt(s) => {
                    let words: Vec<&str> = s.split_whitespace().collect();
                    match words.as_slice() {
                        ["endfor"] if loop_var.is_some() => return Ok(nodes),
                        ["endfor"] => return Err(RagError::template("'endfor' without 'for'")),
                        ["for", var, "in", iterable] => {
                            if loop_var.is_some() {
                                return Err(RagError::template("nested loops are not supported"));
                            }
                            if *iterable != DOCUMENTS_VAR {
                                return Err(RagError::template(format!(
                                    "can only loop over '{DOCUMENTS_VAR}', not '{iterable}'"
                                )));
                            }
                            self.variables.insert(DOCUMENTS_VAR);
                            let body = self.parse_block(Some(*var))?;
                            nodes.push(Node::ForDocuments(body));
                        }
                        _ => return Err(RagError::template(format!("unknown tag '{{% {s} %}}'"))),
                    }
                }
            }
        }

        match loop_var {
            Some(_) => Err(RagError::template("'for' without matching 'endfor'")),
            None => Ok(nodes),
        }
    }

    fn parse_expr(&mut self, expr: &str, loop_var: Option<&str>) -> Result<Node> {
        let parts: Vec<&str> = expr.split('.').map(str::trim).collect();
        match parts.as_slice() {
            [QUERY_VAR] => {
                self.variables.insert(QUERY_VAR);
                Ok(Node::Query)
            }
            [var, rest @ ..] if Some(*var) == loop_var => {
                let field = match rest {
                    ["id"] => DocField::Id,
                    ["content"] => DocField::Content,
                    ["score"] => DocField::Score,
                    ["meta", key] if !key.is_empty() => DocField::Meta((*key).to_string()),
                    _ => {
                        return Err(RagError::template(format!(
                            "unknown document field in '{{{{ {expr} }}}}'"
                        )));
                    }
                };
                Ok(Node::DocField(field))
            }
            _ => Err(RagError::template(format!(
                "undefined variable in '{{{{ {expr} }}}}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// PromptBuilder
// ---------------------------------------------------------------------------

/// A parsed template, rendered against a [`PromptContext`].
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    nodes: Vec<Node>,
    variables: BTreeSet<&'static str>,
}

impl PromptBuilder {
    /// Parse and check `template`.
    pub fn new(template: &str) -> Result<Self> {
        let mut parser = Parser {
            tokens: lex(template)?.into_iter(),
            variables: BTreeSet::new(),
        };
        let nodes = parser.parse_block(None)?;
        Ok(Self {
            nodes,
            variables: parser.variables,
        })
    }

    /// Context variables the template references.
    pub fn variables(&self) -> &BTreeSet<&'static str> {
        &self.variables
    }

    pub fn render(&self, ctx: &PromptContext<'_>) -> Result<String> {
        let mut out = String::new();
        render_nodes(&self.nodes, ctx, None, &mut out)?;
        Ok(out)
    }
}

fn render_nodes(
    nodes: &[Node],
    ctx: &PromptContext<'_>,
    doc: Option<&Document>,
    out: &mut String,
) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Query => out.push_str(ctx.query),
            Node::ForDocuments(body) => {
                for d in ctx.documents {
                    render_nodes(body, ctx, Some(d), out)?;
                }
            }
            Node::DocField(field) => {
                let Some(d) = doc else {
                    return Err(RagError::template("document field used outside a loop"));
                };
                match field {
                    DocField::Id => out.push_str(d.id()),
                    DocField::Content => out.push_str(d.content()),
                    DocField::Score => {
                        let score = d.score().ok_or_else(|| {
                            RagError::template(format!("document {} has no score", d.id()))
                        })?;
                        out.push_str(&format!("{score:.4}"));
                    }
                    DocField::Meta(key) => match d.meta().get(key) {
                        Some(Json::String(s)) => out.push_str(s),
                        Some(other) => out.push_str(&other.to_string()),
                        None => {
                            return Err(RagError::template(format!(
                                "document {} has no metadata key '{key}'",
                                d.id()
                            )));
                        }
                    },
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Component for PromptBuilder {
    fn inputs(&self) -> Vec<Port> {
        [(QUERY_VAR, ValueKind::Text), (DOCUMENTS_VAR, ValueKind::Documents)]
            .into_iter()
            .map(|(name, kind)| Port {
                name: name.to_string(),
                kind,
                required: self.variables.contains(name),
            })
            .collect()
    }

    fn outputs(&self) -> Vec<Port> {
        vec![Port::required("prompt", ValueKind::Text)]
    }

    async fn run(&self, mut inputs: Inputs) -> Result<Outputs> {
        let query = inputs.opt_text(QUERY_VAR)?.unwrap_or_default();
        let documents = inputs.opt_documents(DOCUMENTS_VAR)?.unwrap_or_default();

        let prompt = self.render(&PromptContext {
            documents: &documents,
            query: &query,
        })?;
        debug!(documents = documents.len(), prompt_len = prompt.len(), "prompt rendered");

        Ok(Outputs::from([("prompt".to_string(), Value::Text(prompt))]))
    }
}
