//! Task handlers and the default registry wiring them to task kinds.

use std::collections::HashMap;
use std::sync::Arc;

use citypulse_ai::InsightModel;
use citypulse_bus::EventBus;
use citypulse_common::TaskKind;
use citypulse_store::RecordStore;

use crate::TaskHandler;

pub mod notification;
pub mod resource;
pub mod summary;
pub mod trend;

pub use notification::NotificationHandler;
pub use resource::ResourceAllocationHandler;
pub use summary::DailySummaryHandler;
pub use trend::TrendAnalysisHandler;

/// Standard production registry. The notification handler serves both
/// blast and single-department alert kinds.
pub fn default_registry(
    store: Arc<dyn RecordStore>,
    bus: Arc<dyn EventBus>,
    insight: Arc<dyn InsightModel>,
) -> HashMap<TaskKind, Arc<dyn TaskHandler>> {
    let notification = Arc::new(NotificationHandler::new(
        store.clone(),
        bus.clone(),
        insight.clone(),
    ));

    let mut registry: HashMap<TaskKind, Arc<dyn TaskHandler>> = HashMap::new();
    registry.insert(TaskKind::NotificationBlast, notification.clone());
    registry.insert(TaskKind::DepartmentAlert, notification);
    registry.insert(
        TaskKind::TrendAnalysis,
        Arc::new(TrendAnalysisHandler::new(
            store.clone(),
            bus,
            insight.clone(),
        )),
    );
    registry.insert(
        TaskKind::ResourceAllocation,
        Arc::new(ResourceAllocationHandler::new(
            store.clone(),
            insight.clone(),
        )),
    );
    registry.insert(
        TaskKind::DailySummary,
        Arc::new(DailySummaryHandler::new(store, insight)),
    );
    registry
}
