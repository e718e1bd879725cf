use std::sync::Arc;

use application::{ConnectionHub, RealtimeGateway};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<RealtimeGateway>,
}

impl AppState {
    pub fn new(gateway: Arc<RealtimeGateway>) -> Self {
        Self { gateway }
    }

    /// 本实例的本地连接注册表
    pub fn hub(&self) -> &Arc<ConnectionHub> {
        self.gateway.hub()
    }
}
