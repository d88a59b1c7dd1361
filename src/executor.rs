use crate::config::HarvesterConfig;
use crate::harvest::pipeline::{Extraction, ExtractionPipeline, PipelineError};
use crate::model::FileSnapshot;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

/// Runs extractions for many layers with bounded concurrency.
pub struct LayerExecutor {
    semaphore: Arc<Semaphore>,
}

impl LayerExecutor {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
        }
    }

    pub fn from_config(config: &HarvesterConfig) -> Self {
        Self::new(config.max_concurrent_layers)
    }

    #[instrument(skip(self, pipeline, snapshot), fields(files = snapshot.len()))]
    pub async fn execute(
        &self,
        layer: &str,
        pipeline: Arc<ExtractionPipeline>,
        snapshot: FileSnapshot,
    ) -> Result<Extraction, PipelineError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| PipelineError::Join {
                layer: layer.to_string(),
                reason: format!("Semaphore error: {}", e),
            })?;

        info!("Starting extraction for layer: {}", layer);
        let result = pipeline.extract(&snapshot).await;
        info!("Finished extraction for layer: {}", layer);
        result
    }

    /// Extracts every `(layer id, snapshot)` pair concurrently.
    ///
    /// Results come back in input order. A panicking extraction becomes
    /// [`PipelineError::Join`] for its layer only.
    pub async fn extract_all(
        &self,
        pipeline: Arc<ExtractionPipeline>,
        layers: Vec<(String, FileSnapshot)>,
    ) -> Vec<(String, Result<Extraction, PipelineError>)> {
        let mut tasks = JoinSet::new();
        let ids: Vec<String> = layers.iter().map(|(id, _)| id.clone()).collect();

        for (index, (layer, snapshot)) in layers.into_iter().enumerate() {
            let semaphore = Arc::clone(&self.semaphore);
            let pipeline = Arc::clone(&pipeline);
            tasks.spawn(async move {
                let executor = LayerExecutor { semaphore };
                (index, executor.execute(&layer, pipeline, snapshot).await)
            });
        }

        let mut results: Vec<Option<Result<Extraction, PipelineError>>> =
            (0..ids.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!(error = %e, "Extraction task did not complete"),
            }
        }

        ids.into_iter()
            .zip(results)
            .map(|(layer, result)| {
                let result = result.unwrap_or_else(|| {
                    Err(PipelineError::Join {
                        layer: layer.clone(),
                        reason: "extraction task panicked or was cancelled".to_string(),
                    })
                });
                (layer, result)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::formats::DpkgLister;

    fn status(package: &str, version: &str) -> FileSnapshot {
        FileSnapshot::new().with_file(
            "var/lib/dpkg/status",
            format!("Package: {package}\nVersion: {version}\n"),
        )
    }

    #[tokio::test]
    async fn test_extract_all_preserves_order() {
        let pipeline = Arc::new(ExtractionPipeline::new(vec![Box::new(DpkgLister::new())]));
        let executor = LayerExecutor::new(2);

        let layers = vec![
            ("sha256:aaa".to_string(), status("bash", "5.2.15-2")),
            ("sha256:bbb".to_string(), FileSnapshot::new()),
            ("sha256:ccc".to_string(), status("zlib1g", "1:1.2.13.dfsg-1")),
        ];
        let results = executor.extract_all(pipeline, layers).await;

        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["sha256:aaa", "sha256:bbb", "sha256:ccc"]);

        let first = results[0].1.as_ref().unwrap();
        assert!(first.inventory.contains("bash", "5.2.15-2"));
        assert!(results[1].1.as_ref().unwrap().inventory.is_empty());
        assert!(results[2]
            .1
            .as_ref()
            .unwrap()
            .inventory
            .contains("zlib1g", "1:1.2.13.dfsg-1"));
    }

    #[tokio::test]
    async fn test_execute_single_layer() {
        let pipeline = Arc::new(ExtractionPipeline::new(vec![Box::new(DpkgLister::new())]));
        let executor = LayerExecutor::from_config(&HarvesterConfig::default());

        let extraction = executor
            .execute("sha256:aaa", pipeline, status("tzdata", "2024a-0+deb12u1"))
            .await
            .unwrap();
        assert_eq!(extraction.inventory.len(), 1);
    }
}
