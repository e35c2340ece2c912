use crate::judge::run_judge;
use async_trait::async_trait;
use tribunal_core::errors::Result;
use tribunal_core::evaluator::{EvalContext, Evaluator};
use tribunal_core::model::{TestCase, Verdict};

const INSTRUCTIONS: &str = "Rate whether every claim in the system response is \
faithful to the retrieved context: each statement must be entailed by it. \
Score 1 when all claims are supported, 0 when none are.";

pub struct FaithfulnessEvaluator;

#[async_trait]
impl Evaluator for FaithfulnessEvaluator {
    fn kind(&self) -> &'static str {
        "faithfulness"
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
        let judged = run_judge(cx, "faithfulness", INSTRUCTIONS, case, system_response).await?;
        Ok(Verdict {
            score: judged.score,
            passed: judged.score >= self.default_threshold(),
            reasoning: judged.reasoning,
        })
    }
}
