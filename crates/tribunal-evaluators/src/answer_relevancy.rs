use crate::judge::run_judge;
use async_trait::async_trait;
use tribunal_core::errors::Result;
use tribunal_core::evaluator::{EvalContext, Evaluator};
use tribunal_core::model::{TestCase, Verdict};

const INSTRUCTIONS: &str = "Rate how directly the system response addresses the \
user input. Penalize evasions, topic drift, and filler; do not penalize \
correctness issues, only relevance.";

pub struct AnswerRelevancyEvaluator;

#[async_trait]
impl Evaluator for AnswerRelevancyEvaluator {
    fn kind(&self) -> &'static str {
        "answer_relevancy"
    }

    fn default_threshold(&self) -> f64 {
        0.8
    }

    async fn evaluate(
        &self,
        case: &TestCase,
        system_response: &str,
        cx: &EvalContext,
    ) -> Result<Verdict> {
        let judged = run_judge(cx, "answer relevancy", INSTRUCTIONS, case, system_response).await?;
        Ok(Verdict {
            score: judged.score,
            passed: judged.score >= self.default_threshold(),
            reasoning: judged.reasoning,
        })
    }
}
