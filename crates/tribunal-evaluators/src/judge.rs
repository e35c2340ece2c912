use tribunal_core::connector::{InvokeParameters, InvokeRequest, Message};
use tribunal_core::errors::Result;
use tribunal_core::evaluator::EvalContext;
use tribunal_core::model::TestCase;

pub(crate) struct JudgeOutcome {
    pub score: f64,
    pub reasoning: String,
}

/// One judge call through the Model Connector. The rubric instructions are
/// the only thing that varies between evaluator kinds.
pub(crate) async fn run_judge(
    cx: &EvalContext,
    rubric: &str,
    instructions: &str,
    case: &TestCase,
    system_response: &str,
) -> Result<JudgeOutcome> {
    let context_block = match case.context.as_object() {
        Some(obj) if !obj.is_empty() => {
            serde_json::to_string_pretty(&case.context).unwrap_or_default()
        }
        _ => "none".to_string(),
    };

    let prompt = format!(
        "{instructions}\n\n\
         User input:\n{input}\n\n\
         Retrieved context:\n{context}\n\n\
         System response:\n{response}\n\n\
         Respond with a JSON object: {{\"score\": <number between 0 and 1>, \"reasoning\": \"<one sentence>\"}}",
        instructions = instructions,
        input = case.user_input,
        context = context_block,
        response = system_response,
    );

    let resp = cx
        .connector
        .invoke(InvokeRequest {
            model_id: cx.judge_model.clone(),
            messages: vec![
                Message::system(format!(
                    "You are a strict evaluation judge scoring {}.",
                    rubric
                )),
                Message::user(prompt),
            ],
            parameters: InvokeParameters::default(),
            timeout: cx.call_timeout,
            idempotency_key: Some(cx.idempotency_key.clone()),
            tenant_id: cx.tenant_id.clone(),
        })
        .await?;

    Ok(parse_judge_text(&resp.text))
}

/// Pulls `{score, reasoning}` out of the judge reply. Falls back to a
/// deterministic text heuristic when the model did not return JSON, so
/// replay/fake providers still yield stable verdicts.
pub(crate) fn parse_judge_text(text: &str) -> JudgeOutcome {
    if let Some(v) = extract_json(text) {
        if let Some(score) = v.get("score").and_then(|s| s.as_f64()) {
            let reasoning = v
                .get("reasoning")
                .and_then(|r| r.as_str())
                .unwrap_or("")
                .to_string();
            return JudgeOutcome {
                score: score.clamp(0.0, 1.0),
                reasoning,
            };
        }
    }
    let score = if text.to_lowercase().contains("fail") {
        0.0
    } else {
        1.0
    };
    JudgeOutcome {
        score,
        reasoning: text.chars().take(200).collect(),
    }
}

fn extract_json(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
