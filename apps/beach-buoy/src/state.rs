use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::coordinator::SignalingCoordinator;
use crate::synth::SynthCodeSource;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: SignalingCoordinator,
    pub synth: Arc<dyn SynthCodeSource>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(coordinator: SignalingCoordinator, synth: Arc<dyn SynthCodeSource>) -> Self {
        Self {
            coordinator,
            synth,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }
}
