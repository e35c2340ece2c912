//! Built-in evaluator kinds. Each one is a pure function of
//! `(case, system_response, context)` whose only side effect is calling the
//! Model Connector; registration happens once at process start.

use std::sync::Arc;
use tribunal_core::errors::Result;
use tribunal_core::evaluator::Registry;

mod answer_relevancy;
mod contextual_precision;
mod faithfulness;
mod hallucination;
mod judge;

pub use answer_relevancy::AnswerRelevancyEvaluator;
pub use contextual_precision::ContextualPrecisionEvaluator;
pub use faithfulness::FaithfulnessEvaluator;
pub use hallucination::HallucinationEvaluator;

pub fn default_registry() -> Result<Registry> {
    let mut registry = Registry::new();
    registry.register(Arc::new(HallucinationEvaluator))?;
    registry.register(Arc::new(AnswerRelevancyEvaluator))?;
    registry.register(Arc::new(FaithfulnessEvaluator))?;
    registry.register(Arc::new(ContextualPrecisionEvaluator))?;
    Ok(registry)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_holds_the_four_builtin_kinds() {
        let registry = default_registry().unwrap();
        assert_eq!(
            registry.kinds(),
            vec![
                "answer_relevancy",
                "contextual_precision",
                "faithfulness",
                "hallucination"
            ]
        );
    }
}
