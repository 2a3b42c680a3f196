use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::models::{Paper, PaperAnalysis, SearchQuery};

/// Longest abstract excerpt sent for screening, in bytes.
const SNIPPET_BYTES: usize = 500;

#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("classifier API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("classifier returned no content")]
    Empty,
}

/// A text model that answers a prompt with (ideally) a JSON object.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, prompt: &Prompt) -> Result<String, ClassifierError>;
}

/// What the papers are being screened for.
#[derive(Debug, Clone)]
pub struct ResearchContext {
    pub keywords: Vec<String>,
    pub field: Option<String>,
}

impl ResearchContext {
    pub fn from_query(query: &SearchQuery) -> Self {
        Self {
            keywords: query
                .keywords
                .iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
            field: query.filters.field.clone(),
        }
    }

    fn describe(&self) -> String {
        let mut out = format!("Research topic keywords: {}", self.keywords.join(", "));
        if let Some(field) = &self.field {
            out.push_str(&format!("\nField: {}", field));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreeningDecision {
    pub should_analyze: bool,
    pub reason: String,
}

impl ScreeningDecision {
    fn fail_open(reason: impl Into<String>) -> Self {
        Self {
            should_analyze: true,
            reason: reason.into(),
        }
    }
}

/// `readingDecision` arrives as a boolean or as a word, depending on the model.
#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

impl Flag {
    fn as_bool(&self) -> Option<bool> {
        match self {
            Flag::Bool(b) => Some(*b),
            Flag::Text(t) => match t.trim().to_lowercase().as_str() {
                "true" | "yes" | "read" => Some(true),
                "false" | "no" | "skip" => Some(false),
                _ => None,
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreeningReply {
    reading_decision: Flag,
    reading_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisReply {
    reading_decision: Option<Flag>,
    reading_reason: Option<String>,
    relevance_score: Option<f32>,
    abstract_summary: Option<String>,
    #[serde(default)]
    key_findings: Vec<String>,
    methodology: Option<String>,
    #[serde(default)]
    limitations: Vec<String>,
}

fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &s[..end]
}

/// The JSON object inside a reply, without markdown fences or surrounding prose.
fn json_body(reply: &str) -> &str {
    let trimmed = reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

fn metadata_block(paper: &Paper, abstract_limit: Option<usize>) -> String {
    let authors = paper
        .authors
        .iter()
        .map(|a| a.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let date = paper
        .publication_date
        .map(|d| d.to_string())
        .or_else(|| paper.year.map(|y| y.to_string()))
        .unwrap_or_else(|| "unknown".into());
    let keywords = paper
        .keywords
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let abstract_text = paper.abstract_text.as_deref().unwrap_or("(no abstract)");
    let abstract_text = match abstract_limit {
        Some(limit) => truncate_to_char_boundary(abstract_text, limit),
        None => abstract_text,
    };

    format!(
        "Title: {}\nAuthors: {}\nVenue: {}\nPublished: {}\nCitations: {}\nKeywords: {}\nAbstract: {}",
        paper.title,
        if authors.is_empty() { "unknown" } else { &authors },
        paper.venue.as_deref().unwrap_or("unknown"),
        date,
        paper.citation_count,
        keywords,
        abstract_text,
    )
}

/// Decides which papers deserve full analysis and runs that analysis.
///
/// Neither operation fails: a classifier error or an unusable reply yields a permissive
/// default so no paper is dropped because the model misbehaved.
pub struct ScreeningGate {
    classifier: Arc<dyn Classifier>,
}

impl ScreeningGate {
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self { classifier }
    }

    pub async fn screen(&self, paper: &Paper, context: &ResearchContext) -> ScreeningDecision {
        let prompt = Prompt {
            system: "You screen academic papers for a literature review. Reply with a JSON \
                     object {\"readingDecision\": true|false, \"readingReason\": \"...\"}."
                .into(),
            user: format!(
                "{}\n\n{}\n\nShould this paper be read in full?",
                context.describe(),
                metadata_block(paper, Some(SNIPPET_BYTES))
            ),
        };

        let reply = match self.classifier.classify(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(id = %paper.id, "Screening failed, keeping paper: {}", e);
                return ScreeningDecision::fail_open(format!("screening unavailable: {}", e));
            }
        };

        let parsed: ScreeningReply = match serde_json::from_str(json_body(&reply)) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(id = %paper.id, "Unparseable screening reply: {}", e);
                return ScreeningDecision::fail_open("unparseable screening reply");
            }
        };
        match parsed.reading_decision.as_bool() {
            Some(should_analyze) => ScreeningDecision {
                should_analyze,
                reason: parsed.reading_reason.unwrap_or_default(),
            },
            None => ScreeningDecision::fail_open("ambiguous screening decision"),
        }
    }

    pub async fn analyze(&self, paper: &Paper, context: &ResearchContext) -> PaperAnalysis {
        let prompt = Prompt {
            system: "You analyze academic papers. Reply with a JSON object with fields \
                     readingDecision (bool), readingReason, relevanceScore (0-10), \
                     abstractSummary, keyFindings (list), methodology, limitations (list)."
                .into(),
            user: format!("{}\n\n{}", context.describe(), metadata_block(paper, None)),
        };

        let reply = match self.classifier.classify(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(id = %paper.id, "Analysis failed: {}", e);
                return PaperAnalysis::fallback(format!("analysis unavailable: {}", e));
            }
        };

        match serde_json::from_str::<AnalysisReply>(json_body(&reply)) {
            Ok(parsed) => PaperAnalysis {
                reading_decision: parsed
                    .reading_decision
                    .and_then(|f| f.as_bool())
                    .unwrap_or(true),
                reading_reason: parsed.reading_reason.unwrap_or_default(),
                relevance_score: parsed.relevance_score.unwrap_or(0.0).clamp(0.0, 10.0),
                abstract_summary: parsed.abstract_summary,
                key_findings: parsed.key_findings,
                methodology: parsed.methodology,
                limitations: parsed.limitations,
                analyzed_at: Utc::now(),
            },
            Err(e) => {
                tracing::warn!(id = %paper.id, "Unparseable analysis reply: {}", e);
                PaperAnalysis::fallback("unparseable analysis reply")
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replies with a fixed string, or fails when none is set. Records the last prompt.
    pub(crate) struct ScriptedClassifier {
        reply: Option<String>,
        pub last_prompt: Mutex<Option<Prompt>>,
    }

    impl ScriptedClassifier {
        pub(crate) fn replying(reply: &str) -> Self {
            Self {
                reply: Some(reply.to_string()),
                last_prompt: Mutex::new(None),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                reply: None,
                last_prompt: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Classifier for ScriptedClassifier {
        async fn classify(&self, prompt: &Prompt) -> Result<String, ClassifierError> {
            *self.last_prompt.lock().unwrap() = Some(prompt.clone());
            self.reply.clone().ok_or(ClassifierError::Api {
                status: 503,
                message: "down".into(),
            })
        }
    }

    fn context() -> ResearchContext {
        ResearchContext::from_query(&SearchQuery::new(vec!["quantum".into(), " ".into()]))
    }

    fn paper() -> Paper {
        let mut p = Paper::new("test", "Quantum Error Correction", Some("10.1/q")).unwrap();
        p.abstract_text = Some("é".repeat(400));
        p
    }

    async fn screen_with(reply: &str) -> ScreeningDecision {
        let gate = ScreeningGate::new(Arc::new(ScriptedClassifier::replying(reply)));
        gate.screen(&paper(), &context()).await
    }

    #[tokio::test]
    async fn test_screen_parses_bool_and_string_decisions() {
        let d = screen_with(r#"{"readingDecision": false, "readingReason": "off topic"}"#).await;
        assert_eq!(
            d,
            ScreeningDecision {
                should_analyze: false,
                reason: "off topic".into()
            }
        );

        let d = screen_with("```json\n{\"readingDecision\": \"yes\"}\n```").await;
        assert!(d.should_analyze);

        let d = screen_with("Sure! {\"readingDecision\": \"no\", \"readingReason\": \"old\"}").await;
        assert!(!d.should_analyze);
    }

    #[tokio::test]
    async fn test_screen_fails_open() {
        assert!(screen_with("not json at all").await.should_analyze);
        assert!(screen_with(r#"{"readingDecision": "maybe"}"#).await.should_analyze);

        let gate = ScreeningGate::new(Arc::new(ScriptedClassifier::failing()));
        let d = gate.screen(&paper(), &context()).await;
        assert!(d.should_analyze);
        assert!(d.reason.contains("unavailable"));
    }

    #[tokio::test]
    async fn test_screen_prompt_carries_bounded_snippet() {
        let classifier = Arc::new(ScriptedClassifier::replying(r#"{"readingDecision": true}"#));
        let gate = ScreeningGate::new(classifier.clone());
        gate.screen(&paper(), &context()).await;

        let prompt = classifier.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.user.contains("Title: Quantum Error Correction"));
        assert!(prompt.user.contains("Research topic keywords: quantum\n"));
        let abstract_line = prompt.user.lines().find(|l| l.starts_with("Abstract: ")).unwrap();
        let snippet = abstract_line.trim_start_matches("Abstract: ");
        assert_eq!(snippet.len(), SNIPPET_BYTES);
    }

    #[tokio::test]
    async fn test_analyze_reply_and_fallback() {
        let gate = ScreeningGate::new(Arc::new(ScriptedClassifier::replying(
            r#"{"readingDecision": true, "readingReason": "core", "relevanceScore": 14,
                "abstractSummary": "s", "keyFindings": ["a", "b"], "methodology": "m"}"#,
        )));
        let analysis = gate.analyze(&paper(), &context()).await;
        assert!(analysis.reading_decision);
        assert_eq!(analysis.relevance_score, 10.0);
        assert_eq!(analysis.key_findings, vec!["a", "b"]);
        assert!(analysis.limitations.is_empty());

        let gate = ScreeningGate::new(Arc::new(ScriptedClassifier::replying("{broken")));
        let analysis = gate.analyze(&paper(), &context()).await;
        assert_eq!(analysis.reading_reason, "unparseable analysis reply");
        assert!(analysis.reading_decision);
    }

    #[test]
    fn test_truncate_to_char_boundary() {
        let text = "Hello 世界";
        let truncated = truncate_to_char_boundary(text, 8);
        assert!(truncated.len() <= 8);
        assert!(text.starts_with(truncated));
        assert_eq!(truncate_to_char_boundary("Hello", 100), "Hello");
    }
}
