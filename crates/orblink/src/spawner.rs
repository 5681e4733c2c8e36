//! Where a link runs the work it is handed: inbound calls and its own
//! background tasks.

use std::future::Future;
use std::pin::Pin;

use tokio::runtime::Handle;

pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait Spawner: Send + Sync + 'static {
    fn spawn(&self, task: Task);
}

/// Spawns onto a tokio runtime: the given one, or the caller's.
#[derive(Debug, Clone, Default)]
pub struct TokioSpawner {
    handle: Option<Handle>,
}

impl TokioSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self { handle: Some(handle) }
    }
}

impl Spawner for TokioSpawner {
    fn spawn(&self, task: Task) {
        match &self.handle {
            Some(handle) => {
                handle.spawn(task);
            }
            None => {
                tokio::spawn(task);
            }
        }
    }
}
