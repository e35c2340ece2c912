use crate::judge::run_judge;
use async_trait::async_trait;
use tribunal_core::errors::Result;
use tribunal_core::evaluator::{EvalContext, Evaluator};
use tribunal_core::model::{TestCase, Verdict};

const INSTRUCTIONS: &str = "Rate how much of the system response is fabricated, \
i.e. stated as fact but not supported by the user input or the retrieved context. \
A score of 1 means entirely fabricated, 0 means fully supported.";

/// Inverse metric: the judge scores the degree of hallucination, the
/// verdict score is its complement, so a higher score still means better.
pub struct HallucinationEvaluator;

#[async_trait]
impl Evaluator for HallucinationEvaluator {
    fn kind(&self) -> &'static str {
        "hallucination"
    }

    async fn evaluate(
        &self,
        case: &TestCase,
        system_response: &str,
        cx: &EvalContext,
    ) -> Result<Verdict> {
        let judged = run_judge(cx, "hallucination", INSTRUCTIONS, case, system_response).await?;
        let score = 1.0 - judged.score;
        Ok(Verdict {
            score,
            passed: score >= self.default_threshold(),
            reasoning: judged.reasoning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{cx_with_reply, sample_case};

    #[tokio::test]
    async fn inverts_the_judge_score() {
        let cx = cx_with_reply(r#"{"score": 0.9, "reasoning": "mostly invented"}"#);
        let case = sample_case(&["hallucination"]);
        let v = HallucinationEvaluator
            .evaluate(&case, "made-up answer", &cx)
            .await
            .unwrap();
        assert!((v.score - 0.1).abs() < 1e-9);
        assert!(!v.passed);
    }

    #[tokio::test]
    async fn grounded_response_passes() {
        let cx = cx_with_reply(r#"{"score": 0.0, "reasoning": "fully grounded"}"#);
        let case = sample_case(&["hallucination"]);
        let v = HallucinationEvaluator
            .evaluate(&case, "grounded answer", &cx)
            .await
            .unwrap();
        assert_eq!(v.score, 1.0);
        assert!(v.passed);
    }
}
