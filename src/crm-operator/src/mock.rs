use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{LaunchSpec, NodeInfo, Operator, OperatorError, ServerState, ServerStatus};

/// An in-memory, scriptable backend used by tests. Launching a service
/// records it; `get_server_status` returns whatever was last set with
/// `set_status`, defaulting to `Staging` with zero ready instances.
#[derive(Default)]
pub struct MockOperator {
    nodes: Mutex<Vec<NodeInfo>>,
    services: Mutex<HashMap<(String, String), ServerStatus>>,
    fail_launch: Mutex<bool>,
    requires_broker: bool,
}

impl MockOperator {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        MockOperator {
            nodes: Mutex::new(nodes),
            services: Mutex::new(HashMap::new()),
            fail_launch: Mutex::new(false),
            requires_broker: false,
        }
    }

    pub fn requiring_broker(mut self) -> Self {
        self.requires_broker = true;
        self
    }

    pub fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        *self.nodes.lock().unwrap() = nodes;
    }

    pub fn fail_next_launch(&self) {
        *self.fail_launch.lock().unwrap() = true;
    }

    pub fn set_status(&self, namespace: &str, name: &str, status: ServerStatus) {
        self.services
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), status);
    }
}

#[async_trait]
impl Operator for MockOperator {
    async fn get_resource(&self, _cluster_id: &str) -> Result<Vec<NodeInfo>, OperatorError> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn launch_server(&self, _cluster_id: &str, spec: LaunchSpec) -> Result<(), OperatorError> {
        let mut fail = self.fail_launch.lock().unwrap();
        if *fail {
            *fail = false;
            return Err(OperatorError::Backend("launch failed".into()));
        }
        self.services.lock().unwrap().insert(
            (spec.namespace.clone(), spec.name.clone()),
            ServerStatus {
                status: ServerState::Staging,
                current_instances: 0,
            },
        );
        Ok(())
    }

    async fn scale_server(
        &self,
        _cluster_id: &str,
        namespace: &str,
        name: &str,
        target_instance: u32,
    ) -> Result<(), OperatorError> {
        let mut services = self.services.lock().unwrap();
        let entry = services
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or(OperatorError::NotFound)?;
        entry.status = ServerState::Staging;
        entry.current_instances = entry.current_instances.min(target_instance);
        Ok(())
    }

    async fn get_server_status(
        &self,
        _cluster_id: &str,
        namespace: &str,
        name: &str,
    ) -> Result<ServerStatus, OperatorError> {
        self.services
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or(OperatorError::NotFound)
    }

    async fn release_server(
        &self,
        _cluster_id: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), OperatorError> {
        self.services
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or(OperatorError::NotFound)
    }

    fn requires_broker(&self) -> bool {
        self.requires_broker
    }
}
