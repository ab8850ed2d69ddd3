//! Process-wide driver module initialization

use driver::DriverLoader;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

/// Loads the driver module on first use and shares it afterwards
///
/// Concurrent first callers wait on the same load. A failed load is not
/// remembered, so the next caller tries again. Create one per process and
/// hand an `Arc` of it to every session controller.
pub struct ModuleCell<L: DriverLoader> {
    loader: L,
    module: OnceCell<Arc<L::Module>>,
}

impl<L: DriverLoader> ModuleCell<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            module: OnceCell::new(),
        }
    }

    /// The loaded module, loading it if needed
    pub async fn get(&self) -> driver::Result<Arc<L::Module>> {
        self.module
            .get_or_try_init(|| async {
                info!("Loading camera driver module");
                self.loader.load().await.map(Arc::new)
            })
            .await
            .cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.module.initialized()
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }
}
