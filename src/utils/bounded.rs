use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Spawns tasks while keeping at most `max_concurrent` of them running.
///
/// `spawn` suspends the caller until a slot frees up, so a submission loop
/// naturally throttles itself against slow tasks. Used to fan out per-file
/// verification without opening hundreds of files at once.
pub struct BoundedSpawner {
    semaphore: Arc<Semaphore>,
}

impl BoundedSpawner {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub async fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        tokio::spawn(async move {
            let _permit = permit;
            future.await
        })
    }
}
