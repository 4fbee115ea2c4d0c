//! Cron job CRUD and on-demand runs.
//!
//! Tenant connections operate on their own scheduler (ensured on first
//! touch, started when scheduling is enabled). Non-tenant operators reach
//! the global scheduler, or a named tenant's via `tenantId`.

use serde::Deserialize;
use serde_json::{Value, json};

use gatehouse_core::{GatewayError, GatewayResult};
use gatehouse_sched::{JobUpdate, ScheduledJob, Scheduler, SchedulerScope};

use crate::dispatch::{Dispatcher, RequestCtx};
use crate::handlers::store_err;
use crate::server::Gateway;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ScopeParams {
    tenant_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddParams {
    #[serde(default)]
    tenant_id: Option<String>,
    name: String,
    schedule: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    delivery: Option<Value>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobParams {
    #[serde(default)]
    tenant_id: Option<String>,
    job_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobUpdateParams {
    #[serde(default)]
    tenant_id: Option<String>,
    job_id: String,
    #[serde(flatten)]
    update: JobUpdate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunsParams {
    #[serde(default)]
    tenant_id: Option<String>,
    job_id: String,
    #[serde(default = "default_runs_limit")]
    limit: usize,
}

fn default_runs_limit() -> usize {
    20
}

/// Resolve the scheduler a call targets.
fn scheduler_for(
    gateway: &Gateway,
    ctx: &RequestCtx,
    requested: Option<String>,
) -> GatewayResult<Scheduler> {
    match ctx.conn.record().tenant_id() {
        Some(own) => {
            if requested.as_deref().is_some_and(|req| req != own) {
                return Err(GatewayError::unauthorized(
                    "tenantId does not match authenticated tenant",
                ));
            }
            Ok(gateway.schedulers.ensure_tenant(own))
        },
        None => match requested {
            Some(tenant) => Ok(gateway.schedulers.ensure_tenant(&tenant)),
            None => Ok(gateway.schedulers.global()),
        },
    }
}

pub(super) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register("cron.list", |gateway, ctx| async move {
        let params: ScopeParams = ctx.params()?;
        let scheduler = scheduler_for(&gateway, &ctx, params.tenant_id)?;
        let jobs = scheduler.store().load().map_err(store_err)?;
        Ok(json!({ "jobs": jobs }))
    });

    dispatcher.register("cron.get", |gateway, ctx| async move {
        let params: JobParams = ctx.params()?;
        let scheduler = scheduler_for(&gateway, &ctx, params.tenant_id)?;
        let job = scheduler
            .store()
            .get(&params.job_id)
            .map_err(store_err)?
            .ok_or_else(|| GatewayError::not_found(format!("job not found: {}", params.job_id)))?;
        Ok(serde_json::to_value(job).unwrap_or_default())
    });

    dispatcher.register("cron.add", |gateway, ctx| async move {
        let params: AddParams = ctx.params()?;
        let scheduler = scheduler_for(&gateway, &ctx, params.tenant_id)?;
        let mut job = ScheduledJob::new(params.name, params.schedule, params.payload);
        job.enabled = params.enabled;
        job.delivery = params.delivery;
        job.agent_id = params.agent_id;
        let job = scheduler.store().add(job).map_err(store_err)?;
        Ok(serde_json::to_value(job).unwrap_or_default())
    });

    dispatcher.register("cron.update", |gateway, ctx| async move {
        let params: JobUpdateParams = ctx.params()?;
        let scheduler = scheduler_for(&gateway, &ctx, params.tenant_id)?;
        let job = scheduler
            .store()
            .update(&params.job_id, params.update)
            .map_err(store_err)?;
        Ok(serde_json::to_value(job).unwrap_or_default())
    });

    dispatcher.register("cron.remove", |gateway, ctx| async move {
        let params: JobParams = ctx.params()?;
        let scheduler = scheduler_for(&gateway, &ctx, params.tenant_id)?;
        scheduler.store().remove(&params.job_id).map_err(store_err)?;
        Ok(json!({ "removed": params.job_id }))
    });

    dispatcher.register("cron.enable", |gateway, ctx| async move {
        set_enabled(&gateway, &ctx, true).await
    });

    dispatcher.register("cron.disable", |gateway, ctx| async move {
        set_enabled(&gateway, &ctx, false).await
    });

    dispatcher.register("cron.run", |gateway, ctx| async move {
        let params: JobParams = ctx.params()?;
        let scheduler = scheduler_for(&gateway, &ctx, params.tenant_id)?;
        let summary = scheduler
            .run_now(&params.job_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| GatewayError::not_found(format!("job not found: {}", params.job_id)))?;
        Ok(json!({
            "ok": summary.ok,
            "sessionKey": summary.session_key,
            "durationMs": summary.duration_ms,
            "error": summary.error,
        }))
    });

    dispatcher.register("cron.runs", |gateway, ctx| async move {
        let params: RunsParams = ctx.params()?;
        let scheduler = scheduler_for(&gateway, &ctx, params.tenant_id)?;
        let path = match scheduler.scope() {
            SchedulerScope::Global => gateway.layout.global_run_log(&params.job_id),
            SchedulerScope::Tenant(tenant) => {
                gateway.layout.tenant_run_log(tenant, &params.job_id)
            },
        };
        let runs = match std::fs::read_to_string(path) {
            Ok(content) => {
                let lines: Vec<&str> = content.lines().collect();
                lines
                    .iter()
                    .rev()
                    .take(params.limit)
                    .filter_map(|line| serde_json::from_str::<Value>(line).ok())
                    .collect::<Vec<_>>()
            },
            Err(_) => Vec::new(),
        };
        Ok(json!({ "runs": runs }))
    });
}

async fn set_enabled(
    gateway: &Gateway,
    ctx: &RequestCtx,
    enabled: bool,
) -> GatewayResult<Value> {
    let params: JobParams = ctx.params()?;
    let scheduler = scheduler_for(gateway, ctx, params.tenant_id)?;
    let job = scheduler
        .store()
        .update(
            &params.job_id,
            JobUpdate {
                enabled: Some(enabled),
                ..JobUpdate::default()
            },
        )
        .map_err(store_err)?;
    Ok(serde_json::to_value(job).unwrap_or_default())
}
