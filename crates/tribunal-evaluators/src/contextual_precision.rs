use crate::judge::run_judge;
use async_trait::async_trait;
use tribunal_core::errors::Result;
use tribunal_core::evaluator::{EvalContext, Evaluator};
use tribunal_core::model::{TestCase, Verdict};

const INSTRUCTIONS: &str = "Rate whether the pieces of retrieved context that are \
actually relevant to the user input were the ones the system response relied on, \
rather than irrelevant ones. Score 1 when the response draws only on relevant \
context, 0 when it leans on irrelevant context.";

pub struct ContextualPrecisionEvaluator;

#[async_trait]
impl Evaluator for ContextualPrecisionEvaluator {
    fn kind(&self) -> &'static str {
        "contextual_precision"
    }

    async fn evaluate(
        &self,
        case: &TestCase,
        system_response: &str,
        cx: &EvalContext,
    ) -> Result<Verdict> {
        let judged = run_judge(
            cx,
            "contextual precision",
            INSTRUCTIONS,
            case,
            system_response,
        )
        .await?;
        Ok(Verdict {
            score: judged.score,
            passed: judged.score >= self.default_threshold(),
            reasoning: judged.reasoning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{cx_with_reply, sample_case};

    #[tokio::test]
    async fn default_threshold_is_half() {
        let cx = cx_with_reply(r#"{"score": 0.6, "reasoning": "mostly relevant context"}"#);
        let case = sample_case(&["contextual_precision"]);
        let v = ContextualPrecisionEvaluator
            .evaluate(&case, "answer", &cx)
            .await
            .unwrap();
        assert!(v.passed);
        assert_eq!(v.score, 0.6);
    }
}
