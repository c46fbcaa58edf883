//! The process runtime: shared registries and per-instance execution driving.
//!
//! A [`ProcessRuntime`] owns the definition registry, the (runtime-wide) work
//! item handler registry, and the table of live instances. Every instance sits
//! behind its own `tokio::sync::Mutex`, giving each entry point the exclusive
//! access the engine requires; distinct instances execute fully in parallel.
//!
//! Sub-process spawning, parent/child completion linking, cascade aborts, and
//! timer arming are drained here after every instance call, through an
//! iterative follow-up queue — never by re-entering a locked instance.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::core::context::RuntimeContext;
use crate::core::work_item::{WorkItemHandler, WorkItemHandlerRegistry, WorkItemId};
use crate::definition::types::ProcessDefinition;
use crate::definition::validator::validate;
use crate::error::{ProcessError, ProcessResult};
use crate::instance::marshal::ProcessInstanceSnapshot;
use crate::instance::node_instance::{NodeInstanceId, TimerId};
use crate::instance::process_instance::{
    EngineConfig, EngineServices, ProcessFault, ProcessInstance, ProcessState, SubProcessSpawn,
    FAULT_ERROR,
};
use crate::instance::ContainerId;

struct ParentLink {
    parent_id: String,
    node_instance: NodeInstanceId,
}

struct TerminalInfo {
    state: ProcessState,
    variables: HashMap<String, Value>,
    fault: Option<ProcessFault>,
}

struct Notification {
    parent_id: String,
    node_instance: NodeInstanceId,
    info: TerminalInfo,
}

#[derive(Default)]
struct Followups {
    spawns: VecDeque<(String, SubProcessSpawn)>,
    notifications: VecDeque<Notification>,
    aborts: VecDeque<String>,
}

impl Followups {
    fn is_empty(&self) -> bool {
        self.spawns.is_empty() && self.notifications.is_empty() && self.aborts.is_empty()
    }
}

/// Shared engine runtime for one application context.
pub struct ProcessRuntime {
    definitions: DashMap<String, Arc<ProcessDefinition>>,
    handlers: Arc<WorkItemHandlerRegistry>,
    instances: DashMap<String, Arc<Mutex<ProcessInstance>>>,
    parent_links: DashMap<String, ParentLink>,
    context: Arc<RuntimeContext>,
    config: EngineConfig,
}

impl ProcessRuntime {
    pub fn new() -> Self {
        ProcessRuntime {
            definitions: DashMap::new(),
            handlers: Arc::new(WorkItemHandlerRegistry::new()),
            instances: DashMap::new(),
            parent_links: DashMap::new(),
            context: Arc::new(RuntimeContext::default()),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_context(mut self, context: Arc<RuntimeContext>) -> Self {
        self.context = context;
        self
    }

    /// Register (and validate) a process definition.
    pub fn register_process(&self, definition: ProcessDefinition) -> ProcessResult<()> {
        validate(&definition)?;
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    /// Register a work item handler for a work name, shared by all instances.
    pub fn register_work_item_handler(&self, work_name: &str, handler: Arc<dyn WorkItemHandler>) {
        self.handlers.register(work_name, handler);
    }

    pub fn definition(&self, process_id: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions.get(process_id).map(|e| e.value().clone())
    }

    /// Handle to a live (or finished) instance.
    pub fn instance(&self, instance_id: &str) -> Option<Arc<Mutex<ProcessInstance>>> {
        self.instances.get(instance_id).map(|e| e.value().clone())
    }

    pub async fn state(&self, instance_id: &str) -> ProcessResult<ProcessState> {
        let arc = self
            .instance(instance_id)
            .ok_or_else(|| ProcessError::InstanceNotFound(instance_id.to_string()))?;
        let guard = arc.lock().await;
        Ok(guard.state())
    }

    pub async fn get_variable(&self, instance_id: &str, name: &str) -> ProcessResult<Option<Value>> {
        let arc = self
            .instance(instance_id)
            .ok_or_else(|| ProcessError::InstanceNotFound(instance_id.to_string()))?;
        let guard = arc.lock().await;
        Ok(guard.get_variable(name))
    }

    fn services(&self) -> EngineServices<'_> {
        EngineServices {
            handlers: &*self.handlers,
            context: &*self.context,
        }
    }

    // ================================
    // Lifecycle entry points
    // ================================

    /// Start a new instance of a registered process.
    pub async fn start_process(
        self: &Arc<Self>,
        process_id: &str,
        initial: HashMap<String, Value>,
    ) -> ProcessResult<String> {
        let definition = self
            .definition(process_id)
            .ok_or_else(|| ProcessError::ProcessNotFound(process_id.to_string()))?;
        let instance_id = self.context.id_generator.next_id();
        let arc = Arc::new(Mutex::new(ProcessInstance::new(
            instance_id.clone(),
            definition,
            self.config.clone(),
        )));
        self.instances.insert(instance_id.clone(), arc.clone());

        let mut followups = Followups::default();
        let result = {
            let mut guard = arc.lock().await;
            let r = guard.start(&self.services(), initial).await;
            self.collect_followups(&instance_id, &mut guard, &mut followups);
            r
        };
        self.run_followups(followups).await?;
        result?;
        Ok(instance_id)
    }

    /// Deliver a signal to one instance.
    pub async fn signal(
        self: &Arc<Self>,
        instance_id: &str,
        event_type: &str,
        payload: Value,
    ) -> ProcessResult<()> {
        let arc = self
            .instance(instance_id)
            .ok_or_else(|| ProcessError::InstanceNotFound(instance_id.to_string()))?;
        let mut followups = Followups::default();
        let result = {
            let mut guard = arc.lock().await;
            let r = guard.signal(&self.services(), event_type, payload).await;
            self.collect_followups(instance_id, &mut guard, &mut followups);
            r
        };
        self.run_followups(followups).await?;
        result
    }

    /// Complete an active work item.
    pub async fn complete_work_item(
        self: &Arc<Self>,
        instance_id: &str,
        work_item_id: WorkItemId,
        results: HashMap<String, Value>,
    ) -> ProcessResult<()> {
        let arc = self
            .instance(instance_id)
            .ok_or_else(|| ProcessError::InstanceNotFound(instance_id.to_string()))?;
        let mut followups = Followups::default();
        let result = {
            let mut guard = arc.lock().await;
            let r = guard
                .complete_work_item(&self.services(), work_item_id, results)
                .await;
            self.collect_followups(instance_id, &mut guard, &mut followups);
            r
        };
        self.run_followups(followups).await?;
        result
    }

    /// Abort an active work item.
    pub async fn abort_work_item(
        self: &Arc<Self>,
        instance_id: &str,
        work_item_id: WorkItemId,
    ) -> ProcessResult<()> {
        let arc = self
            .instance(instance_id)
            .ok_or_else(|| ProcessError::InstanceNotFound(instance_id.to_string()))?;
        let mut followups = Followups::default();
        let result = {
            let mut guard = arc.lock().await;
            let r = guard.abort_work_item(&self.services(), work_item_id).await;
            self.collect_followups(instance_id, &mut guard, &mut followups);
            r
        };
        self.run_followups(followups).await?;
        result
    }

    /// Fire a scheduled timer (also used by the internal timer tasks).
    pub async fn fire_timer(
        self: &Arc<Self>,
        instance_id: &str,
        timer_id: TimerId,
    ) -> ProcessResult<()> {
        let arc = self
            .instance(instance_id)
            .ok_or_else(|| ProcessError::InstanceNotFound(instance_id.to_string()))?;
        let mut followups = Followups::default();
        let result = {
            let mut guard = arc.lock().await;
            let r = guard.fire_timer(&self.services(), timer_id).await;
            self.collect_followups(instance_id, &mut guard, &mut followups);
            r
        };
        self.run_followups(followups).await?;
        result
    }

    /// Abort an instance; cascades to dependent children.
    pub async fn abort(self: &Arc<Self>, instance_id: &str) -> ProcessResult<()> {
        self.parent_links.remove(instance_id);
        let arc = self
            .instance(instance_id)
            .ok_or_else(|| ProcessError::InstanceNotFound(instance_id.to_string()))?;
        let mut followups = Followups::default();
        let result = {
            let mut guard = arc.lock().await;
            let r = guard.abort(&self.services()).await;
            self.collect_followups(instance_id, &mut guard, &mut followups);
            r
        };
        self.run_followups(followups).await?;
        result
    }

    /// Re-attempt the faulted node of an instance in the error state.
    pub async fn retrigger(self: &Arc<Self>, instance_id: &str) -> ProcessResult<()> {
        let arc = self
            .instance(instance_id)
            .ok_or_else(|| ProcessError::InstanceNotFound(instance_id.to_string()))?;
        let mut followups = Followups::default();
        let result = {
            let mut guard = arc.lock().await;
            let r = guard.retrigger(&self.services()).await;
            self.collect_followups(instance_id, &mut guard, &mut followups);
            r
        };
        self.run_followups(followups).await?;
        result
    }

    pub async fn suspend(&self, instance_id: &str) -> ProcessResult<()> {
        let arc = self
            .instance(instance_id)
            .ok_or_else(|| ProcessError::InstanceNotFound(instance_id.to_string()))?;
        let mut guard = arc.lock().await;
        guard.suspend()
    }

    pub async fn resume(&self, instance_id: &str) -> ProcessResult<()> {
        let arc = self
            .instance(instance_id)
            .ok_or_else(|| ProcessError::InstanceNotFound(instance_id.to_string()))?;
        let mut guard = arc.lock().await;
        guard.resume()
    }

    /// Add a dynamic work item to an active dynamic container.
    pub async fn add_dynamic_work_item(
        self: &Arc<Self>,
        instance_id: &str,
        container: NodeInstanceId,
        work_name: &str,
        parameters: HashMap<String, Value>,
    ) -> ProcessResult<NodeInstanceId> {
        let arc = self
            .instance(instance_id)
            .ok_or_else(|| ProcessError::InstanceNotFound(instance_id.to_string()))?;
        let mut followups = Followups::default();
        let result = {
            let mut guard = arc.lock().await;
            let r = guard
                .add_dynamic_work_item(&self.services(), container, work_name, parameters)
                .await;
            self.collect_followups(instance_id, &mut guard, &mut followups);
            r
        };
        self.run_followups(followups).await?;
        result
    }

    /// Add a dynamic sub-process to an active dynamic container.
    pub async fn add_dynamic_sub_process(
        self: &Arc<Self>,
        instance_id: &str,
        container: NodeInstanceId,
        process_id: &str,
        parameters: HashMap<String, Value>,
    ) -> ProcessResult<NodeInstanceId> {
        let arc = self
            .instance(instance_id)
            .ok_or_else(|| ProcessError::InstanceNotFound(instance_id.to_string()))?;
        let mut followups = Followups::default();
        let result = {
            let mut guard = arc.lock().await;
            let r = guard
                .add_dynamic_sub_process(&self.services(), container, process_id, parameters)
                .await;
            self.collect_followups(instance_id, &mut guard, &mut followups);
            r
        };
        self.run_followups(followups).await?;
        result
    }

    // ================================
    // Persistence boundary
    // ================================

    /// Capture an instance for external marshalling.
    pub async fn snapshot(&self, instance_id: &str) -> ProcessResult<ProcessInstanceSnapshot> {
        let arc = self
            .instance(instance_id)
            .ok_or_else(|| ProcessError::InstanceNotFound(instance_id.to_string()))?;
        let guard = arc.lock().await;
        guard.snapshot()
    }

    /// Restore a previously captured instance; pending timers are re-armed
    /// with their remaining delay and subscriptions resume identically.
    pub fn restore_instance(
        self: &Arc<Self>,
        snapshot: ProcessInstanceSnapshot,
    ) -> ProcessResult<String> {
        let definition = self
            .definition(&snapshot.process_id)
            .ok_or_else(|| ProcessError::ProcessNotFound(snapshot.process_id.clone()))?;
        let instance = ProcessInstance::restore(definition, self.config.clone(), snapshot)?;
        let instance_id = instance.id().to_string();
        let now = self.context.time_provider.now_millis();
        let timers: Vec<(TimerId, u64)> = instance
            .timers()
            .iter()
            .map(|(tid, t)| {
                let remaining = (t.armed_at_ms + t.delay_ms as i64 - now).max(0) as u64;
                (*tid, remaining)
            })
            .collect();
        self.instances
            .insert(instance_id.clone(), Arc::new(Mutex::new(instance)));
        for (timer_id, delay) in timers {
            self.schedule_timer(&instance_id, timer_id, delay);
        }
        Ok(instance_id)
    }

    // ================================
    // Follow-up draining
    // ================================

    fn collect_followups(
        self: &Arc<Self>,
        instance_id: &str,
        guard: &mut ProcessInstance,
        followups: &mut Followups,
    ) {
        for (timer_id, delay) in guard.take_pending_timer_arms() {
            self.schedule_timer(instance_id, timer_id, delay);
        }
        for spawn in guard.take_pending_spawns() {
            followups.spawns.push_back((instance_id.to_string(), spawn));
        }
        for child in guard.take_pending_child_aborts() {
            followups.aborts.push_back(child);
        }
        if guard.state().is_terminal() {
            if let Some((_, link)) = self.parent_links.remove(instance_id) {
                followups.notifications.push_back(Notification {
                    parent_id: link.parent_id,
                    node_instance: link.node_instance,
                    info: TerminalInfo {
                        state: guard.state(),
                        variables: guard.variables(),
                        fault: guard.fault().cloned(),
                    },
                });
            }
        }
    }

    async fn run_followups(self: &Arc<Self>, mut followups: Followups) -> ProcessResult<()> {
        let mut steps = 0;
        while !followups.is_empty() {
            steps += 1;
            if steps > self.config.max_steps {
                return Err(ProcessError::MaxStepsExceeded(self.config.max_steps));
            }
            if let Some((parent_id, spawn)) = followups.spawns.pop_front() {
                self.start_child(&parent_id, spawn, &mut followups).await?;
            } else if let Some(notification) = followups.notifications.pop_front() {
                self.deliver_notification(notification, &mut followups)
                    .await?;
            } else if let Some(instance_id) = followups.aborts.pop_front() {
                self.abort_child(&instance_id, &mut followups).await?;
            }
        }
        Ok(())
    }

    async fn start_child(
        self: &Arc<Self>,
        parent_id: &str,
        spawn: SubProcessSpawn,
        followups: &mut Followups,
    ) -> ProcessResult<()> {
        let Some(definition) = self.definition(&spawn.process_id) else {
            if spawn.wait_for_completion {
                followups.notifications.push_back(Notification {
                    parent_id: parent_id.to_string(),
                    node_instance: spawn.node_instance,
                    info: TerminalInfo {
                        state: ProcessState::Error,
                        variables: HashMap::new(),
                        fault: Some(ProcessFault {
                            fault_name: FAULT_ERROR.to_string(),
                            node_id: String::new(),
                            container: ContainerId::Process,
                            data: Some(Value::String(format!(
                                "process definition not found: {}",
                                spawn.process_id
                            ))),
                        }),
                    },
                });
            }
            return Ok(());
        };

        let child_id = self.context.id_generator.next_id();
        let arc = Arc::new(Mutex::new(ProcessInstance::new(
            child_id.clone(),
            definition,
            self.config.clone(),
        )));
        self.instances.insert(child_id.clone(), arc.clone());
        if spawn.wait_for_completion {
            self.parent_links.insert(
                child_id.clone(),
                ParentLink {
                    parent_id: parent_id.to_string(),
                    node_instance: spawn.node_instance,
                },
            );
        }

        let start_result = {
            let mut guard = arc.lock().await;
            let r = guard.start(&self.services(), spawn.parameters).await;
            self.collect_followups(&child_id, &mut guard, followups);
            r
        };
        if let Err(e) = start_result {
            warn!(child = child_id.as_str(), error = %e, "sub-process start failed");
            // A failure that did not leave the child in a terminal state still
            // resolves the waiting parent.
            if let Some((_, link)) = self.parent_links.remove(&child_id) {
                followups.notifications.push_back(Notification {
                    parent_id: link.parent_id,
                    node_instance: link.node_instance,
                    info: TerminalInfo {
                        state: ProcessState::Error,
                        variables: HashMap::new(),
                        fault: Some(ProcessFault {
                            fault_name: FAULT_ERROR.to_string(),
                            node_id: String::new(),
                            container: ContainerId::Process,
                            data: Some(Value::String(e.to_string())),
                        }),
                    },
                });
            }
            return Ok(());
        }

        // Child still running and the parent is waiting: record the live link.
        if self.parent_links.contains_key(&child_id) {
            if let Some(parent_arc) = self.instance(parent_id) {
                let mut parent = parent_arc.lock().await;
                parent.set_sub_process_child(spawn.node_instance, &child_id);
            }
        }
        Ok(())
    }

    async fn deliver_notification(
        self: &Arc<Self>,
        notification: Notification,
        followups: &mut Followups,
    ) -> ProcessResult<()> {
        let Some(arc) = self.instance(&notification.parent_id) else {
            return Ok(());
        };
        let mut guard = arc.lock().await;
        let services = self.services();
        match notification.info.state {
            ProcessState::Completed => {
                guard
                    .on_sub_process_completed(
                        &services,
                        notification.node_instance,
                        notification.info.variables,
                    )
                    .await?;
            }
            _ => {
                let (fault_name, data) = notification
                    .info
                    .fault
                    .map(|f| (f.fault_name, f.data))
                    .unwrap_or_else(|| (FAULT_ERROR.to_string(), None));
                guard
                    .on_sub_process_faulted(
                        &services,
                        notification.node_instance,
                        fault_name,
                        data,
                    )
                    .await?;
            }
        }
        self.collect_followups(&notification.parent_id, &mut guard, followups);
        Ok(())
    }

    async fn abort_child(
        self: &Arc<Self>,
        instance_id: &str,
        followups: &mut Followups,
    ) -> ProcessResult<()> {
        self.parent_links.remove(instance_id);
        let Some(arc) = self.instance(instance_id) else {
            return Ok(());
        };
        let mut guard = arc.lock().await;
        guard.abort(&self.services()).await?;
        self.collect_followups(instance_id, &mut guard, followups);
        Ok(())
    }

    fn schedule_timer(self: &Arc<Self>, instance_id: &str, timer_id: TimerId, delay_ms: u64) {
        let runtime = Arc::clone(self);
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Err(e) = runtime.fire_timer(&instance_id, timer_id).await {
                warn!(instance = instance_id.as_str(), timer = timer_id, error = %e, "timer firing failed");
            }
        });
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}
