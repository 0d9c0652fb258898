//! Structured logging for dispatch and reconciliation events
//!
//! Field names are stable so log pipelines can filter on `event`.

use keeper_core::{ExecutionStatus, JobExecution, KeeperError};
use tracing::{debug, error, info, warn};

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_execution_dispatched(execution: &JobExecution, spider_name: &str) {
        info!(
            event = "execution_dispatched",
            execution.id = execution.id,
            job_instance.id = execution.job_instance_id,
            spider.name = spider_name,
            agent.run_id = %execution.agent_run_id,
            agent.host = execution.running_on.as_deref().unwrap_or("-"),
            "Execution dispatched to agent"
        );
    }

    pub fn log_dispatch_rejected(job_instance_id: i64, error: &KeeperError) {
        warn!(
            event = "dispatch_rejected",
            job_instance.id = job_instance_id,
            error = %error,
            "Dispatch rejected"
        );
    }

    pub fn log_status_transition(
        execution_id: i64,
        agent_run_id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) {
        info!(
            event = "status_transition",
            execution.id = execution_id,
            agent.run_id = agent_run_id,
            status.from = %from,
            status.to = %to,
            "Execution status updated"
        );
    }

    pub fn log_inferred_completion(execution_id: i64, agent_run_id: &str, age_seconds: i64) {
        warn!(
            event = "inferred_completion",
            execution.id = execution_id,
            agent.run_id = agent_run_id,
            execution.age_seconds = age_seconds,
            "Agent lost the run record, marking execution finished"
        );
    }

    pub fn log_agent_unreachable(host: &str, operation: &str, error: &KeeperError) {
        warn!(
            event = "agent_unreachable",
            agent.host = host,
            operation = operation,
            error = %error,
            "Agent unreachable, skipped for this pass"
        );
    }

    pub fn log_cron_fired(job_instance_id: i64, spider_name: &str, tick: &str) {
        info!(
            event = "cron_fired",
            job_instance.id = job_instance_id,
            spider.name = spider_name,
            cron.tick = tick,
            "Periodic job instance due"
        );
    }

    pub fn log_reconcile_pass(
        incomplete: usize,
        updated: usize,
        inferred: usize,
        unreachable_hosts: &[String],
        duration_ms: u64,
    ) {
        if unreachable_hosts.is_empty() {
            debug!(
                event = "reconcile_pass",
                executions.incomplete = incomplete,
                executions.updated = updated,
                executions.inferred = inferred,
                duration_ms = duration_ms,
                "Reconciliation pass completed"
            );
        } else {
            warn!(
                event = "reconcile_pass",
                executions.incomplete = incomplete,
                executions.updated = updated,
                executions.inferred = inferred,
                agents.unreachable = ?unreachable_hosts,
                duration_ms = duration_ms,
                "Reconciliation pass completed with unreachable agents"
            );
        }
    }

    pub fn log_loop_error(component: &str, operation: &str, error: &KeeperError) {
        error!(
            event = "loop_error",
            component = component,
            operation = operation,
            error = %error,
            "Unit of work failed, loop continues"
        );
    }
}
