//! Mutable-state reads: snapshot, long-poll, and describe.
//!
//! The long-poll protocol subscribes to the history-event notifier, then
//! re-reads once to close the subscribe race, and loops on a select over
//! {notification, poll timer, caller cancellation (drop)}.

use super::types::{
    DescribeMutableStateResponse, DescribeWorkflowExecutionRequest,
    DescribeWorkflowExecutionResponse, GetMutableStateRequest, GetMutableStateResponse,
    ResetStickyTaskListRequest,
};
use super::ShardEngine;
use crate::core::identity::{CurrentRunKey, ExecutionKey};
use crate::core::{EngineError, Result, FIRST_EVENT_ID};
use crate::state::{MutableState, WorkflowState};
use tracing::debug;
use uuid::Uuid;

impl ShardEngine {
    /// Snapshot of a run's mutable state, optionally blocking until
    /// `expected_next_event_id` is visible.
    pub async fn get_mutable_state(
        &self,
        request: GetMutableStateRequest,
    ) -> Result<GetMutableStateResponse> {
        self.get_mutable_state_or_polling(request).await
    }

    /// Long-poll variant whose passive-cluster `EntityNotExists` is
    /// enriched with cluster hints.
    pub async fn poll_mutable_state(
        &self,
        request: GetMutableStateRequest,
    ) -> Result<GetMutableStateResponse> {
        let domain_id = request.domain_id;
        self.get_mutable_state_or_polling(request)
            .await
            .map_err(|e| self.enrich_entity_not_exists(e, domain_id))
    }

    async fn get_mutable_state_or_polling(
        &self,
        mut request: GetMutableStateRequest,
    ) -> Result<GetMutableStateResponse> {
        let mut response = self
            .load_mutable_state_snapshot(request.domain_id, &request.workflow_id, request.run_id)
            .await?;

        let expected_branch = match &request.current_branch_token {
            Some(token) => token.clone(),
            None => response.current_branch_token.clone(),
        };
        if expected_branch != response.current_branch_token {
            return Err(EngineError::CurrentBranchChanged {
                current_branch_token: response.current_branch_token,
            });
        }
        // Pin the run in case the caller asked for "current".
        request.run_id = Some(response.run_id);

        let expected_next_event_id = if request.expected_next_event_id == 0 {
            FIRST_EVENT_ID
        } else {
            request.expected_next_event_id
        };

        if expected_next_event_id < response.next_event_id || !response.is_workflow_running {
            return Ok(response);
        }

        // Long poll: subscribe first, then re-read to close the race with
        // a commit that landed between load and watch.
        let key = ExecutionKey::new(
            request.domain_id,
            request.workflow_id.clone(),
            response.run_id,
        );
        let (subscriber_id, mut notifications) = self.notifier.watch(&key)?;
        let result = self
            .poll_for_event(
                &request,
                expected_next_event_id,
                &expected_branch,
                &mut notifications,
                response,
            )
            .await;
        self.notifier.unwatch(&key, subscriber_id);
        result
    }

    async fn poll_for_event(
        &self,
        request: &GetMutableStateRequest,
        expected_next_event_id: i64,
        expected_branch: &[u8],
        notifications: &mut tokio::sync::mpsc::UnboundedReceiver<crate::notify::EventNotification>,
        mut response: GetMutableStateResponse,
    ) -> Result<GetMutableStateResponse> {
        // Re-check once after subscribing.
        response = self
            .load_mutable_state_snapshot(request.domain_id, &request.workflow_id, request.run_id)
            .await?;
        if expected_branch != response.current_branch_token.as_slice() {
            return Err(EngineError::CurrentBranchChanged {
                current_branch_token: response.current_branch_token,
            });
        }
        if expected_next_event_id < response.next_event_id || !response.is_workflow_running {
            return Ok(response);
        }

        let expiration = self.config.long_poll_expiration_interval;
        let timer = tokio::time::sleep(expiration);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                notification = notifications.recv() => {
                    let notification = match notification {
                        Some(n) => n,
                        None => return Ok(response),
                    };
                    response.last_first_event_id = notification.last_first_event_id;
                    response.next_event_id = notification.next_event_id;
                    response.previous_started_event_id = notification.previous_started_event_id;
                    response.workflow_state = notification.workflow_state;
                    response.close_status = notification.close_status;
                    response.is_workflow_running = notification.is_workflow_running();
                    if expected_branch != notification.current_branch_token.as_slice() {
                        return Err(EngineError::CurrentBranchChanged {
                            current_branch_token: notification.current_branch_token,
                        });
                    }
                    if expected_next_event_id < response.next_event_id
                        || !response.is_workflow_running
                    {
                        return Ok(response);
                    }
                }
                _ = &mut timer => {
                    debug!(
                        workflow_id = %request.workflow_id,
                        expected_next_event_id,
                        "long poll expired, returning latest snapshot"
                    );
                    return Ok(response);
                }
            }
        }
    }

    /// Load a state snapshot under the execution lock. `run_id = None`
    /// resolves the current run first.
    pub(crate) async fn load_mutable_state_snapshot(
        &self,
        domain_id: Uuid,
        workflow_id: &str,
        run_id: Option<Uuid>,
    ) -> Result<GetMutableStateResponse> {
        let run_id = match run_id {
            Some(run_id) if !run_id.is_nil() => run_id,
            _ => {
                let current_key = CurrentRunKey::new(domain_id, workflow_id);
                self.execution_store
                    .get_current_execution(&current_key)
                    .await
                    .map_err(EngineError::from)?
                    .run_id
            }
        };

        let key = ExecutionKey::new(domain_id, workflow_id.to_string(), run_id);
        let mut lease = self.execution_cache.get_or_create(&key).await?;
        let result = match lease.load_mutable_state().await {
            Ok(ms) => Ok(snapshot_response(ms)),
            Err(e) => Err(e),
        };
        lease.release_with(&result);
        result
    }

    /// Rewrite `EntityNotExists` with active/current cluster hints when
    /// the domain is passive here.
    pub(crate) fn enrich_entity_not_exists(
        &self,
        error: EngineError,
        domain_id: Uuid,
    ) -> EngineError {
        let EngineError::EntityNotExists { .. } = &error else {
            return error;
        };
        let Ok(entry) = self.domain_cache.get_domain_by_id(domain_id) else {
            return error;
        };
        if entry.is_active_in(&self.current_cluster_name) {
            return error;
        }
        EngineError::EntityNotExists {
            message: "Workflow execution not found in non-active cluster".to_string(),
            active_cluster: Some(entry.active_cluster_name.clone()),
            current_cluster: Some(self.current_cluster_name.clone()),
        }
    }

    pub async fn describe_workflow_execution(
        &self,
        request: DescribeWorkflowExecutionRequest,
    ) -> Result<DescribeWorkflowExecutionResponse> {
        let key = ExecutionKey::new(request.domain_id, request.workflow_id.clone(), request.run_id);
        let mut lease = self.execution_cache.get_or_create(&key).await?;
        let result = match lease.load_mutable_state().await {
            Ok(ms) => {
                let info = &ms.execution_info;
                let (state, close_status) = ms.workflow_state_close_status();
                Ok(DescribeWorkflowExecutionResponse {
                    workflow_id: info.workflow_id.clone(),
                    run_id: info.run_id,
                    workflow_type: info.workflow_type.clone(),
                    task_list: info.task_list.clone(),
                    execution_timeout: info.execution_timeout,
                    task_timeout: info.task_timeout,
                    start_time: info.start_time,
                    history_length: ms.next_event_id - FIRST_EVENT_ID,
                    close_status: (state == WorkflowState::Completed).then_some(close_status),
                    parent: info.parent.clone(),
                    pending_activities: ms.pending_activities.values().cloned().collect(),
                    pending_children: ms.pending_children.values().cloned().collect(),
                    pending_decision: ms.pending_decision.clone(),
                })
            }
            Err(e) => Err(e),
        };
        lease.release_with(&result);
        result
    }

    /// Expose both the cached and the stored image of a run's state, for
    /// operators chasing divergence.
    pub async fn describe_mutable_state(
        &self,
        request: DescribeWorkflowExecutionRequest,
    ) -> Result<DescribeMutableStateResponse> {
        let key = ExecutionKey::new(request.domain_id, request.workflow_id.clone(), request.run_id);
        let mut lease = self.execution_cache.get_or_create(&key).await?;

        let cached = lease.cached_state().map(to_state_json).transpose();
        let result = match cached {
            Ok(mutable_state_in_cache) => match lease.reload_mutable_state().await {
                Ok(ms) => to_state_json(ms).map(|db| DescribeMutableStateResponse {
                    mutable_state_in_cache,
                    mutable_state_in_database: db,
                }),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        lease.release_with(&result);
        result
    }

    /// Clear the volatile client attributes (stickiness) of a run.
    pub async fn reset_sticky_task_list(&self, request: ResetStickyTaskListRequest) -> Result<()> {
        let key = ExecutionKey::new(request.domain_id, request.workflow_id.clone(), request.run_id);
        self.update_with_action(key, false, |ms| {
            if !ms.is_workflow_execution_running() {
                return Err(EngineError::AlreadyCompleted);
            }
            ms.clear_stickiness();
            Ok(())
        })
        .await
    }
}

fn snapshot_response(ms: &MutableState) -> GetMutableStateResponse {
    let info = &ms.execution_info;
    let (workflow_state, close_status) = ms.workflow_state_close_status();
    GetMutableStateResponse {
        workflow_id: info.workflow_id.clone(),
        run_id: info.run_id,
        workflow_type: info.workflow_type.clone(),
        task_list: info.task_list.clone(),
        sticky_task_list: info.sticky_task_list.clone(),
        sticky_schedule_to_start_timeout: info.sticky_schedule_to_start_timeout,
        client_supports_sticky_query: info.client_supports_sticky_query,
        last_first_event_id: ms.last_first_event_id,
        next_event_id: ms.next_event_id,
        previous_started_event_id: ms.previous_started_event_id,
        is_workflow_running: ms.is_workflow_execution_running(),
        current_branch_token: ms.current_branch_token(),
        workflow_state,
        close_status,
        version_histories: ms.version_histories.clone(),
    }
}

fn to_state_json(ms: &MutableState) -> Result<String> {
    serde_json::to_string(ms)
        .map_err(|e| EngineError::InternalService(format!("failed to serialize state: {}", e)))
}
