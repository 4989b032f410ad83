use super::*;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Backend that replays scripted failures before answering with one-hot vectors
struct ScriptedBackend {
    dimension: usize,
    failures: Mutex<VecDeque<BackendError>>,
    calls: Mutex<Vec<usize>>,
    drop_last: bool,
}

impl ScriptedBackend {
    fn new(dimension: usize, failures: Vec<BackendError>) -> Self {
        Self {
            dimension,
            failures: Mutex::new(failures.into()),
            calls: Mutex::new(Vec::new()),
            drop_last: false,
        }
    }

    fn call_sizes(&self) -> Vec<usize> {
        self.calls.lock().expect("lock should not be poisoned").clone()
    }
}

#[async_trait]
impl EmbeddingBackend for ScriptedBackend {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, BackendError> {
        self.calls
            .lock()
            .expect("lock should not be poisoned")
            .push(texts.len());

        let failure = self
            .failures
            .lock()
            .expect("lock should not be poisoned")
            .pop_front();
        if let Some(failure) = failure {
            return Err(failure);
        }

        let mut vectors: Vec<Vec<f32>> = texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0; self.dimension];
                vector[text.len() % self.dimension] = 1.0;
                vector
            })
            .collect();
        if self.drop_last {
            vectors.pop();
        }
        Ok(vectors)
    }
}

/// Backend that ignores its declared dimension
struct WrongDimensionBackend;

#[async_trait]
impl EmbeddingBackend for WrongDimensionBackend {
    fn model_name(&self) -> &str {
        "wrong"
    }

    fn dimension(&self) -> usize {
        4
    }

    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, BackendError> {
        Ok(texts.iter().map(|_| vec![0.5; 3]).collect())
    }
}

fn embedder_for<B: EmbeddingBackend + 'static>(backend: &Arc<B>, batch_size: usize) -> Embedder {
    let shared: Arc<B> = Arc::clone(backend);
    Embedder::new(shared, batch_size).expect("batch size is valid")
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    }
}

fn texts(count: usize) -> Vec<String> {
    (0..count).map(|i| "x".repeat(i + 1)).collect()
}

#[tokio::test]
async fn splits_input_into_batches_preserving_order() {
    let backend = Arc::new(ScriptedBackend::new(8, Vec::new()));
    let embedder = embedder_for(&backend, 3);

    let input = texts(7);
    let vectors = embedder
        .embed_batch(&input)
        .await
        .expect("embedding should succeed");

    assert_eq!(backend.call_sizes(), vec![3, 3, 1]);
    assert_eq!(vectors.len(), 7);
    for (text, vector) in input.iter().zip(&vectors) {
        assert_eq!(vector.len(), 8);
        assert_eq!(vector[text.len() % 8], 1.0);
    }
}

#[tokio::test]
async fn empty_input_skips_the_backend() {
    let backend = Arc::new(ScriptedBackend::new(8, Vec::new()));
    let embedder = embedder_for(&backend, 3);

    let vectors = embedder
        .embed_batch(&[])
        .await
        .expect("empty input should succeed");

    assert!(vectors.is_empty());
    assert!(backend.call_sizes().is_empty());
}

#[tokio::test]
async fn retries_transient_failures() {
    let backend = Arc::new(ScriptedBackend::new(
        4,
        vec![
            BackendError::Retryable("timeout".to_string()),
            BackendError::Retryable("503".to_string()),
        ],
    ));
    let embedder = embedder_for(&backend, 10).with_retry_policy(fast_retry(3));

    let vector = embedder
        .embed_one("hello")
        .await
        .expect("third attempt should succeed");

    assert_eq!(vector.len(), 4);
    assert_eq!(backend.call_sizes(), vec![1, 1, 1]);
}

#[tokio::test]
async fn gives_up_after_bounded_attempts() {
    let failures = (0..5)
        .map(|_| BackendError::Retryable("connection refused".to_string()))
        .collect();
    let backend = Arc::new(ScriptedBackend::new(4, failures));
    let embedder = embedder_for(&backend, 10).with_retry_policy(fast_retry(3));

    let err = embedder
        .embed_batch(&texts(2))
        .await
        .expect_err("every attempt fails");

    match err {
        ContextError::EmbeddingUnavailable { attempts, reason } => {
            assert_eq!(attempts, 3);
            assert_eq!(reason, "connection refused");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(backend.call_sizes().len(), 3);
}

#[tokio::test]
async fn fatal_errors_are_not_retried() {
    let backend = Arc::new(ScriptedBackend::new(
        4,
        vec![BackendError::Fatal("model not found".to_string())],
    ));
    let embedder = embedder_for(&backend, 10).with_retry_policy(fast_retry(5));

    let err = embedder
        .embed_one("hello")
        .await
        .expect_err("fatal error should surface");

    assert!(matches!(
        err,
        ContextError::EmbeddingUnavailable { attempts: 1, .. }
    ));
    assert_eq!(backend.call_sizes().len(), 1);
}

#[tokio::test]
async fn rejects_vectors_of_the_wrong_dimension() {
    let embedder = Embedder::new(Arc::new(WrongDimensionBackend), 10).expect("batch size is valid");

    let err = embedder
        .embed_one("hello")
        .await
        .expect_err("dimension check should fail");

    assert!(matches!(
        err,
        ContextError::DimensionMismatch {
            expected: 4,
            actual: 3
        }
    ));
}

#[tokio::test]
async fn rejects_short_responses() {
    let mut backend = ScriptedBackend::new(4, Vec::new());
    backend.drop_last = true;
    let embedder = Embedder::new(Arc::new(backend), 10).expect("batch size is valid");

    let err = embedder
        .embed_batch(&texts(3))
        .await
        .expect_err("count mismatch should fail");

    assert!(matches!(err, ContextError::EmbeddingUnavailable { .. }));
    assert!(err.to_string().contains("3 vs 2"));
}

#[test]
fn zero_batch_size_is_rejected() {
    let backend = Arc::new(ScriptedBackend::new(4, Vec::new()));
    assert!(matches!(
        Embedder::new(backend, 0),
        Err(ContextError::Config(_))
    ));
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    let policy = RetryPolicy {
        max_attempts: 10,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(1000),
    };

    assert_eq!(policy.delay_after(1), Duration::from_millis(100));
    assert_eq!(policy.delay_after(2), Duration::from_millis(200));
    assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    assert_eq!(policy.delay_after(4), Duration::from_millis(800));
    assert_eq!(policy.delay_after(5), Duration::from_millis(1000));
    assert_eq!(policy.delay_after(40), Duration::from_millis(1000));
}

#[test]
fn retry_policy_follows_configuration() {
    let config = EmbeddingConfig {
        retry_attempts: 7,
        retry_base_delay_ms: 250,
        retry_max_delay_ms: 2000,
        ..EmbeddingConfig::default()
    };
    let policy = RetryPolicy::from_config(&config);

    assert_eq!(policy.max_attempts, 7);
    assert_eq!(policy.base_delay, Duration::from_millis(250));
    assert_eq!(policy.max_delay, Duration::from_millis(2000));
}
