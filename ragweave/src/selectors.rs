//! Selectors: pick which of several tools should answer a query.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{RagError, Result};
use crate::models::Llm;
use crate::prompts::{MULTI_SELECT_PROMPT, PromptTemplate, SINGLE_SELECT_PROMPT, numbered_list};
use crate::schema::QueryBundle;
use crate::tools::ToolMetadata;

/// One chosen option, by zero-based position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleSelection {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SelectorResult {
    pub selections: Vec<SingleSelection>,
}

impl SelectorResult {
    pub fn indices(&self) -> Vec<usize> {
        self.selections.iter().map(|s| s.index).collect()
    }

    pub fn reasons(&self) -> Vec<&str> {
        self.selections.iter().map(|s| s.reason.as_str()).collect()
    }

    /// The first selection, for single-choice callers.
    pub fn index(&self) -> Result<usize> {
        self.selections
            .first()
            .map(|s| s.index)
            .ok_or_else(|| RagError::InvalidArgument("selector returned no choice".into()))
    }
}

#[async_trait]
pub trait Selector: Send + Sync {
    async fn select(&self, choices: &[ToolMetadata], query: &QueryBundle) -> Result<SelectorResult>;
}

/// Always all choices.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleSelector;

#[async_trait]
impl Selector for SimpleSelector {
    async fn select(
        &self,
        choices: &[ToolMetadata],
        _query: &QueryBundle,
    ) -> Result<SelectorResult> {
        let selections = (0..choices.len())
            .map(|index| SingleSelection { index, reason: String::new() })
            .collect();
        Ok(SelectorResult { selections })
    }
}

/// Always the first choice.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleSelector;

#[async_trait]
impl Selector for SingleSelector {
    async fn select(
        &self,
        choices: &[ToolMetadata],
        _query: &QueryBundle,
    ) -> Result<SelectorResult> {
        if choices.is_empty() {
            return Err(RagError::InvalidArgument("no choices to select from".into()));
        }
        Ok(SelectorResult { selections: vec![SingleSelection { index: 0, reason: String::new() }] })
    }
}

/// Asks the LLM for exactly one choice.
pub struct LlmSingleSelector {
    llm: Arc<dyn Llm>,
    template: PromptTemplate,
}

impl LlmSingleSelector {
    pub fn new(llm: Arc<dyn Llm>) -> Self {
        Self { llm, template: PromptTemplate::new(SINGLE_SELECT_PROMPT) }
    }

    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = template;
        self
    }
}

#[async_trait]
impl Selector for LlmSingleSelector {
    async fn select(
        &self,
        choices: &[ToolMetadata],
        query: &QueryBundle,
    ) -> Result<SelectorResult> {
        let answer = ask(self.llm.as_ref(), &self.template, choices, query, None).await?;
        let mut selections = parse_selections(&answer, choices.len())?;
        selections.truncate(1);
        if selections.is_empty() {
            return Err(RagError::InvalidArgument(format!("no choice in answer '{answer}'")));
        }
        Ok(SelectorResult { selections })
    }
}

/// Asks the LLM for one or more choices.
pub struct LlmMultiSelector {
    llm: Arc<dyn Llm>,
    template: PromptTemplate,
    max_outputs: Option<usize>,
}

impl LlmMultiSelector {
    pub fn new(llm: Arc<dyn Llm>) -> Self {
        Self { llm, template: PromptTemplate::new(MULTI_SELECT_PROMPT), max_outputs: None }
    }

    /// Cap on returned choices; unset allows all of them.
    pub fn with_max_outputs(mut self, max_outputs: usize) -> Self {
        self.max_outputs = Some(max_outputs.max(1));
        self
    }

    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = template;
        self
    }
}

#[async_trait]
impl Selector for LlmMultiSelector {
    async fn select(
        &self,
        choices: &[ToolMetadata],
        query: &QueryBundle,
    ) -> Result<SelectorResult> {
        let max = self.max_outputs.unwrap_or(choices.len());
        let answer = ask(self.llm.as_ref(), &self.template, choices, query, Some(max)).await?;
        let mut selections = parse_selections(&answer, choices.len())?;
        selections.truncate(max);
        Ok(SelectorResult { selections })
    }
}

async fn ask(
    llm: &dyn Llm,
    template: &PromptTemplate,
    choices: &[ToolMetadata],
    query: &QueryBundle,
    max_outputs: Option<usize>,
) -> Result<String> {
    if choices.is_empty() {
        return Err(RagError::InvalidArgument("no choices to select from".into()));
    }
    let descriptions: Vec<&str> = choices.iter().map(|c| c.description.as_str()).collect();
    let num_choices = choices.len().to_string();
    let context_list = numbered_list(&descriptions);
    let max_outputs = max_outputs.unwrap_or(1).to_string();
    let prompt = template.format(&[
        ("num_choices", &num_choices),
        ("context_list", &context_list),
        ("query_str", &query.query_str),
        ("max_outputs", &max_outputs),
    ]);
    let answer = llm.complete(&prompt).await?;
    debug!(choices = choices.len(), answer = %answer, "selector answer");
    Ok(answer)
}

/// Strip a surrounding markdown code fence, if any.
fn strip_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // drop the info string, e.g. ```json
    let rest = rest.split_once('\n').map_or(rest, |(_, body)| body);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn outermost(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

fn choice_number(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Choices in an LLM answer: a JSON array of `{"choice", "reason"}` objects or
/// a single such object. Choices are 1-based in the answer, 0-based here.
pub fn parse_selections(answer: &str, num_choices: usize) -> Result<Vec<SingleSelection>> {
    let body = strip_fences(answer);
    let items: Vec<Value> = if let Some(Ok(Value::Array(items))) =
        outermost(body, '[', ']').map(serde_json::from_str::<Value>)
    {
        items
    } else if let Some(Ok(item @ Value::Object(_))) =
        outermost(body, '{', '}').map(serde_json::from_str::<Value>)
    {
        vec![item]
    } else {
        return Err(RagError::Decode(format!("no selection JSON in answer '{answer}'")));
    };

    let mut selections: Vec<SingleSelection> = Vec::with_capacity(items.len());
    for item in items {
        let choice = item.get("choice").and_then(choice_number).ok_or_else(|| {
            RagError::Decode(format!("selection without a numeric choice: {item}"))
        })?;
        if choice == 0 || choice > num_choices {
            return Err(RagError::InvalidArgument(format!(
                "choice {choice} is outside 1..={num_choices}"
            )));
        }
        let reason = item.get("reason").and_then(Value::as_str).unwrap_or_default().to_string();
        if !selections.iter().any(|s| s.index == choice - 1) {
            selections.push(SingleSelection { index: choice - 1, reason });
        }
    }
    Ok(selections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MockLlm;

    fn choices() -> Vec<ToolMetadata> {
        vec![
            ToolMetadata::new("vector", "Search notes semantically"),
            ToolMetadata::new("keyword", "Look up exact terms"),
            ToolMetadata::new("summary", "Summarize everything"),
        ]
    }

    #[test]
    fn parses_fenced_array() {
        let answer = "```json\n[{\"choice\": 2, \"reason\": \"exact\"}, {\"choice\": \"3\"}]\n```";
        let selections = parse_selections(answer, 3).unwrap();
        assert_eq!(selections[0], SingleSelection { index: 1, reason: "exact".into() });
        assert_eq!(selections[1].index, 2);
    }

    #[test]
    fn parses_lone_object_with_prose() {
        let answer = "I pick {\"choice\": 1, \"reason\": \"r\"} here";
        let selections = parse_selections(answer, 3).unwrap();
        assert_eq!(selections.len(), 1);
        assert_eq!(selections[0].index, 0);
    }

    #[test]
    fn rejects_garbage_and_out_of_range() {
        assert!(matches!(parse_selections("no json", 3), Err(RagError::Decode(_))));
        assert!(matches!(
            parse_selections("[{\"choice\": 4}]", 3),
            Err(RagError::InvalidArgument(_))
        ));
        assert!(matches!(
            parse_selections("[{\"choice\": 0}]", 3),
            Err(RagError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn llm_single_takes_first() {
        let llm = MockLlm::fixed(
            "[{\"choice\": 3, \"reason\": \"a\"}, {\"choice\": 1, \"reason\": \"b\"}]",
        );
        let selector = LlmSingleSelector::new(Arc::new(llm));
        let result = selector.select(&choices(), &QueryBundle::new("q")).await.unwrap();
        assert_eq!(result.indices(), vec![2]);
        assert_eq!(result.reasons(), vec!["a"]);
    }

    #[tokio::test]
    async fn llm_multi_caps_outputs() {
        let llm = MockLlm::fixed("[{\"choice\": 1}, {\"choice\": 2}, {\"choice\": 3}]");
        let selector = LlmMultiSelector::new(Arc::new(llm)).with_max_outputs(2);
        let result = selector.select(&choices(), &QueryBundle::new("q")).await.unwrap();
        assert_eq!(result.indices(), vec![0, 1]);
    }

    #[tokio::test]
    async fn fixed_selectors() {
        let query = QueryBundle::new("q");
        let all = SimpleSelector.select(&choices(), &query).await.unwrap();
        assert_eq!(all.indices(), vec![0, 1, 2]);
        assert_eq!(SingleSelector.select(&choices(), &query).await.unwrap().indices(), vec![0]);
        assert!(SingleSelector.select(&[], &query).await.is_err());
    }
}
