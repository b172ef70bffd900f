//! Job updater — canary phase, then bounded bulk phase.
//!
//! Instances needing change are partitioned by index: the first
//! `canaries` run serially and any failure halts the job before the rest
//! is touched. The remainder goes through a worker pool bounded by
//! `max_in_flight`; the first error stops further scheduling while
//! in-flight updates finish.

use std::sync::Arc;

use tracing::info;

use armada_plan::{ChangeKind, JobPlan, ResourcePoolPlan};
use armada_tasks::TaskLogger;
use armada_workers::{CancelToken, WorkerPool};

use crate::compile::CompiledMap;
use crate::context::SharedNets;
use crate::instance::InstanceUpdater;
use crate::spec;

pub async fn update_job(
    updater: &InstanceUpdater,
    deployment: &str,
    job: &JobPlan,
    pool: &ResourcePoolPlan,
    compiled: &CompiledMap,
    nets: &SharedNets,
    cancel: &CancelToken,
    logger: &Arc<TaskLogger>,
) -> anyhow::Result<()> {
    let changed: Vec<_> = job
        .instances
        .iter()
        .filter(|i| i.change != ChangeKind::NoChange)
        .collect();
    if changed.is_empty() {
        info!(job = %job.name, "job unchanged");
        return Ok(());
    }

    let canary_count = (job.update.canaries as usize).min(changed.len());
    let total = changed.len();
    info!(
        job = %job.name,
        changed = total,
        canaries = canary_count,
        max_in_flight = job.update.max_in_flight,
        "updating job"
    );

    // Canaries run serially; a failure here leaves the rest untouched.
    for (position, inst) in changed[..canary_count].iter().copied().enumerate() {
        cancel.check()?;
        logger.event("Updating canary", &format!("{}/{}", job.name, inst.index), position, total, "started");
        let target = {
            let nets = nets.lock().unwrap();
            spec::build_apply_spec(deployment, job, pool, inst, &nets, compiled)?
        };
        updater.update(job, pool, inst, target, true).await?;
        logger.event("Updating canary", &format!("{}/{}", job.name, inst.index), position, total, "finished");
    }

    // Bulk phase.
    let mut workers = WorkerPool::new(job.update.max_in_flight as usize).with_cancel(cancel.clone());
    for (position, inst) in changed[canary_count..].iter().copied().enumerate() {
        cancel.check()?;
        let target = {
            let nets = nets.lock().unwrap();
            spec::build_apply_spec(deployment, job, pool, inst, &nets, compiled)?
        };
        let updater = updater.clone();
        let job = job.clone();
        let pool = pool.clone();
        let inst = inst.clone();
        let logger = Arc::clone(logger);
        let total_for_unit = total;
        let unit_position = canary_count + position;
        let scheduled = workers
            .spawn(async move {
                let label = format!("{}/{}", job.name, inst.index);
                logger.event("Updating job", &label, unit_position, total_for_unit, "started");
                updater.update(&job, &pool, &inst, target, false).await?;
                logger.event("Updating job", &label, unit_position, total_for_unit, "finished");
                Ok(())
            })
            .await;
        if !scheduled {
            break;
        }
    }
    workers.wait().await
}
