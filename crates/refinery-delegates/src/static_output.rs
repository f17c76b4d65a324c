use futures::future::BoxFuture;
use serde_json::json;

use refinery_core::error::DelegateError;
use refinery_core::traits::AgentDelegate;
use refinery_core::types::{Capability, StageRequest, StageValue};

/// Answers every request without doing any work. Used for dry runs and
/// for checking a pipeline's wiring.
pub struct StaticDelegate {
    name: String,
    output: Option<StageValue>,
}

impl StaticDelegate {
    /// `output` is returned verbatim; without one, each stage gets a
    /// placeholder and evaluations always pass.
    pub fn new(name: impl Into<String>, output: Option<StageValue>) -> Self {
        Self {
            name: name.into(),
            output,
        }
    }

    fn placeholder(request: &StageRequest) -> StageValue {
        match request.capability {
            Capability::Evaluate => json!({
                "passed": true,
                "issues": [],
                "summary": "dry run",
            }),
            _ => json!(format!(
                "[dry run] {} (iteration {})",
                request.stage, request.iteration
            )),
        }
    }
}

impl AgentDelegate for StaticDelegate {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, request: StageRequest) -> BoxFuture<'_, Result<StageValue, DelegateError>> {
        let value = self
            .output
            .clone()
            .unwrap_or_else(|| Self::placeholder(&request));
        Box::pin(async move { Ok(value) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refinery_core::types::RunId;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn request(capability: Capability) -> StageRequest {
        StageRequest {
            run_id: RunId::new(),
            stage: capability.as_str().to_string(),
            capability,
            iteration: 0,
            inputs: BTreeMap::new(),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_fixed_output() {
        let d = StaticDelegate::new("fixed", Some(json!("same")));
        assert_eq!(d.invoke(request(Capability::Design)).await.unwrap(), json!("same"));
        assert_eq!(d.invoke(request(Capability::Evaluate)).await.unwrap(), json!("same"));
    }

    #[tokio::test]
    async fn test_placeholders() {
        let d = StaticDelegate::new("dry", None);
        let design = d.invoke(request(Capability::Design)).await.unwrap();
        assert_eq!(design, json!("[dry run] design (iteration 0)"));
        let eval = d.invoke(request(Capability::Evaluate)).await.unwrap();
        assert_eq!(eval["passed"], true);
    }
}
