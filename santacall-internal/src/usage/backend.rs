use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::Error;
use crate::usage::store::UsageStore;

/// Opens a durable usage store
#[async_trait]
pub trait DurableConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn UsageStore>, Error>;
}

/// Where a [`DurableBackend`] stands after its one initialization attempt
#[derive(Clone)]
pub enum BackendState {
    Uninitialized,
    Ready(Arc<dyn UsageStore>),
    Unavailable,
}

impl std::fmt::Debug for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendState::Uninitialized => write!(f, "Uninitialized"),
            BackendState::Ready(store) => write!(f, "Ready({})", store.name()),
            BackendState::Unavailable => write!(f, "Unavailable"),
        }
    }
}

/// Lazily connected durable store.
///
/// The connector runs at most once per process. If it fails, the backend stays
/// `Unavailable` for good and callers use the volatile store instead.
pub struct DurableBackend {
    connector: Option<Box<dyn DurableConnector>>,
    state: OnceCell<Option<Arc<dyn UsageStore>>>,
}

impl DurableBackend {
    pub fn new(connector: Box<dyn DurableConnector>) -> Self {
        Self {
            connector: Some(connector),
            state: OnceCell::new(),
        }
    }

    /// No durable store configured
    pub fn disabled() -> Self {
        Self {
            connector: None,
            state: OnceCell::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.connector.is_some()
    }

    pub fn state(&self) -> BackendState {
        match self.state.get() {
            None => BackendState::Uninitialized,
            Some(Some(store)) => BackendState::Ready(store.clone()),
            Some(None) => BackendState::Unavailable,
        }
    }

    /// The durable store, connecting on first use. `None` means use the volatile store.
    pub async fn store(&self) -> Option<Arc<dyn UsageStore>> {
        let connector = self.connector.as_ref()?;
        self.state
            .get_or_init(|| async {
                match connector.connect().await {
                    Ok(store) => {
                        info!("Using `{}` as the durable usage store", store.name());
                        Some(store)
                    }
                    Err(e) => {
                        warn!("Durable usage store unavailable, falling back to in-memory storage for the rest of this process: {e}");
                        None
                    }
                }
            })
            .await
            .clone()
    }
}
