//! Consistent query dispatch.
//!
//! A query is dispatched *directly* through matching when any of: the
//! domain is passive here, the run is closed, the caller asked for
//! eventual consistency, or no decision is pending or in flight. Otherwise
//! it is buffered on the run's query registry and the caller parks on a
//! termination channel until a decision-task response settles it.

use super::types::{
    GetMutableStateRequest, GetMutableStateResponse, QueryConsistencyLevel, QueryRejectCondition,
    QueryWorkflowRequest, QueryWorkflowResponse, ResetStickyTaskListRequest,
};
use super::ShardEngine;
use crate::core::identity::ExecutionKey;
use crate::core::{EngineError, Result, EMPTY_EVENT_ID};
use crate::queues::MatchingQueryRequest;
use crate::state::{CloseStatus, QueryResult, QueryTermination};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

impl ShardEngine {
    pub async fn query_workflow(
        &self,
        request: QueryWorkflowRequest,
    ) -> Result<QueryWorkflowResponse> {
        let domain_entry = self.domain_cache.get_domain_by_id(request.domain_id)?;

        if request.consistency_level == QueryConsistencyLevel::Strong
            && !self.config.consistent_query_enabled(&domain_entry.name)
        {
            return Err(EngineError::ConsistentQueryNotEnabled);
        }

        let mut snapshot = self.query_target_snapshot(&request).await?;

        // A closed run with a matching reject condition yields a rejection,
        // never an error.
        if !snapshot.is_workflow_running {
            if let Some(rejection) = evaluate_reject_condition(
                request.reject_condition,
                snapshot.close_status,
            ) {
                return Ok(rejection);
            }
        }

        // A query cannot be answered before the first decision completes;
        // give a young workflow a moment to get there.
        let wait_deadline = Instant::now() + self.first_decision_wait_budget(request.deadline);
        while snapshot.previous_started_event_id <= EMPTY_EVENT_ID
            && Instant::now() < wait_deadline
        {
            tokio::time::sleep(self.config.query_first_decision_task_check_interval).await;
            snapshot = self.query_target_snapshot(&request).await?;
        }
        if snapshot.previous_started_event_id <= EMPTY_EVENT_ID {
            return Err(EngineError::QueryBeforeFirstDecision);
        }

        let key = ExecutionKey::new(
            request.domain_id,
            request.workflow_id.clone(),
            snapshot.run_id,
        );
        let mut lease = self.execution_cache.get_or_create(&key).await?;
        let loaded = lease.load_mutable_state().await;
        let ms = match loaded {
            Ok(ms) => ms,
            Err(e) => {
                let result: Result<()> = Err(e.clone());
                lease.release_with(&result);
                return Err(e);
            }
        };

        let safe_to_dispatch_directly = !domain_entry.is_active_in(&self.current_cluster_name)
            || !ms.is_workflow_execution_running()
            || request.consistency_level == QueryConsistencyLevel::Eventual
            || (!ms.has_pending_decision() && !ms.has_in_flight_decision());

        if safe_to_dispatch_directly {
            lease.release(None);
            let snapshot = self.query_target_snapshot(&request).await?;
            return self
                .query_directly_through_matching(&request, &snapshot)
                .await;
        }

        // Buffer on the context's registry, drop the lock, and wait for
        // termination. The registry outlives state reloads, so a
        // conflict-driven clear elsewhere cannot strand this waiter.
        let registry = lease.query_registry();
        if registry.buffered_ids().len() >= self.config.max_buffered_query_count {
            warn!(
                workflow_id = %request.workflow_id,
                "consistent query buffer full"
            );
            lease.release(None);
            return Err(EngineError::QueryBufferExceeded);
        }
        let (query_id, termination) =
            registry.buffer_query(request.query_type.clone(), request.query_args.clone());
        lease.release(None);

        let wait = async {
            termination
                .await
                .map_err(|_| EngineError::QueryInvalidState)?;
            registry.termination_state(query_id)
        };
        let termination_state = match request.deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline.into(), wait).await {
                    Ok(state) => state,
                    Err(_) => {
                        registry.remove_query(query_id);
                        return Err(EngineError::DeadlineExceeded);
                    }
                }
            }
            None => wait.await,
        };
        registry.remove_query(query_id);

        match termination_state? {
            QueryTermination::Completed(QueryResult::Answered(answer)) => {
                Ok(QueryWorkflowResponse::Answered(answer))
            }
            QueryTermination::Completed(QueryResult::Failed(message)) => {
                Err(EngineError::QueryFailed(message))
            }
            QueryTermination::Unblocked => {
                let snapshot = self.query_target_snapshot(&request).await?;
                self.query_directly_through_matching(&request, &snapshot)
                    .await
            }
            QueryTermination::Failed(error) => Err(error),
        }
    }

    /// Direct dispatch, trying the sticky task list first when eligible.
    async fn query_directly_through_matching(
        &self,
        request: &QueryWorkflowRequest,
        snapshot: &GetMutableStateResponse,
    ) -> Result<QueryWorkflowResponse> {
        let domain_entry = self.domain_cache.get_domain_by_id(request.domain_id)?;

        // Stickiness buys nothing on the passive side: the decider cache
        // there is not maintained by task dispatch, and stale stickiness
        // cannot even be cleared from here.
        let try_sticky = self.config.enable_sticky_query
            && snapshot.sticky_task_list.is_some()
            && snapshot.client_supports_sticky_query
            && domain_entry.is_active_in(&self.current_cluster_name);

        if try_sticky {
            let sticky_task_list = snapshot
                .sticky_task_list
                .clone()
                .expect("checked by try_sticky");
            let sticky_request = MatchingQueryRequest {
                domain_id: request.domain_id,
                workflow_id: request.workflow_id.clone(),
                run_id: snapshot.run_id,
                task_list: sticky_task_list,
                is_sticky: true,
                query_type: request.query_type.clone(),
                query_args: request.query_args.clone(),
            };

            // A fresh budget, not the caller's: a short caller deadline
            // must not be the thing that clears stickiness.
            let sticky_timeout = non_zero_timeout(
                snapshot.sticky_schedule_to_start_timeout,
                Duration::from_secs(5),
            );
            match tokio::time::timeout(
                sticky_timeout,
                self.raw_matching_client.query_workflow(sticky_request),
            )
            .await
            {
                Ok(Ok(response)) => {
                    return Ok(QueryWorkflowResponse::Answered(response.answer));
                }
                Ok(Err(e)) if !matches!(e, EngineError::DeadlineExceeded) => {
                    warn!(
                        workflow_id = %request.workflow_id,
                        query_type = %request.query_type,
                        error = %e,
                        "sticky query dispatch failed, not attempting non-sticky"
                    );
                    return Err(e);
                }
                Ok(Err(_)) | Err(_) => {
                    if snapshot.is_workflow_running {
                        info!(
                            workflow_id = %request.workflow_id,
                            query_type = %request.query_type,
                            "sticky query timed out, clearing stickiness"
                        );
                        let reset = self.reset_sticky_task_list(ResetStickyTaskListRequest {
                            domain_id: request.domain_id,
                            workflow_id: request.workflow_id.clone(),
                            run_id: snapshot.run_id,
                        });
                        match tokio::time::timeout(Duration::from_secs(5), reset).await {
                            Ok(Ok(())) | Ok(Err(EngineError::AlreadyCompleted)) | Err(_) => {}
                            Ok(Err(e)) => return Err(e),
                        }
                    }
                }
            }
            debug!(
                workflow_id = %request.workflow_id,
                query_type = %request.query_type,
                "falling through to non-sticky query dispatch"
            );
        }

        let response = self
            .matching_client
            .query_workflow(MatchingQueryRequest {
                domain_id: request.domain_id,
                workflow_id: request.workflow_id.clone(),
                run_id: snapshot.run_id,
                task_list: snapshot.task_list.clone(),
                is_sticky: false,
                query_type: request.query_type.clone(),
                query_args: request.query_args.clone(),
            })
            .await?;
        Ok(QueryWorkflowResponse::Answered(response.answer))
    }

    async fn query_target_snapshot(
        &self,
        request: &QueryWorkflowRequest,
    ) -> Result<GetMutableStateResponse> {
        self.get_mutable_state(GetMutableStateRequest {
            domain_id: request.domain_id,
            workflow_id: request.workflow_id.clone(),
            run_id: request.run_id,
            expected_next_event_id: 0,
            current_branch_token: None,
        })
        .await
    }

    /// Budget for waiting on the first decision: the configured default,
    /// extended by the caller's deadline minus a safety second. A deadline
    /// under a second never shrinks the default.
    fn first_decision_wait_budget(&self, deadline: Option<Instant>) -> Duration {
        let default = self.config.query_first_decision_task_wait;
        let Some(deadline) = deadline else {
            return default;
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        match remaining.checked_sub(Duration::from_secs(1)) {
            Some(extended) if extended > default => extended,
            _ => default,
        }
    }
}

fn evaluate_reject_condition(
    condition: Option<QueryRejectCondition>,
    close_status: CloseStatus,
) -> Option<QueryWorkflowResponse> {
    match condition? {
        QueryRejectCondition::NotOpen => Some(QueryWorkflowResponse::Rejected { close_status }),
        QueryRejectCondition::NotCompletedCleanly if close_status != CloseStatus::Completed => {
            Some(QueryWorkflowResponse::Rejected { close_status })
        }
        _ => None,
    }
}

fn non_zero_timeout(timeout: Duration, fallback: Duration) -> Duration {
    if timeout.is_zero() {
        fallback
    } else {
        timeout
    }
}
