//! The keeper: one entry point for every externally ordered message.
//!
//! Each message is handled against the latest params epoch and stages
//! its writes in a single [`WriteBatch`]. The batch commits only if the
//! whole message succeeds; a rejected message leaves no trace except
//! routing audit records, which are kept for every enforcement call.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use hpc_core::{BlockContext, EngineParams};
use hpcgrid_settlement::Escrow;
use hpcgrid_state::{ParamsEpoch, StateStore, WriteBatch};

use crate::error::{KeeperError, KeeperResult};
use crate::events::EngineEvent;
use crate::msg::Msg;
use crate::query::Query;

pub(crate) const JOB_SEQUENCE: &str = "job";
pub(crate) const DISPUTE_SEQUENCE: &str = "dispute";

/// Writes and events staged by one message.
pub(crate) struct Tx {
    pub batch: WriteBatch,
    pub events: Vec<EngineEvent>,
    globals: BTreeMap<&'static str, u64>,
    locals: BTreeMap<String, u64>,
}

impl Tx {
    pub fn new() -> Self {
        Self {
            batch: WriteBatch::new(),
            events: Vec::new(),
            globals: BTreeMap::new(),
            locals: BTreeMap::new(),
        }
    }

    pub fn emit(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    /// Next value of a persisted counter (`job`, `dispute`).
    pub fn next_global(&mut self, store: &StateStore, name: &'static str) -> KeeperResult<u64> {
        let current = match self.globals.get(name) {
            Some(v) => *v,
            None => store.sequence(name)?,
        };
        self.globals.insert(name, current + 1);
        Ok(current + 1)
    }

    /// Next sequence in a per-job log, given how many entries are stored.
    pub fn next_local(&mut self, log: String, stored: u64) -> u64 {
        let next = self.locals.get(&log).copied().unwrap_or(stored) + 1;
        self.locals.insert(log, next);
        next
    }

    pub fn commit(mut self, store: &StateStore) -> KeeperResult<Vec<EngineEvent>> {
        for (name, value) in &self.globals {
            self.batch.set_sequence(name, *value)?;
        }
        debug!(writes = self.batch.len(), events = self.events.len(), "committing");
        store.commit(self.batch)?;
        Ok(self.events)
    }
}

/// Deterministic engine over a state store and an escrow.
pub struct Keeper<E: Escrow> {
    pub(crate) store: StateStore,
    pub(crate) escrow: E,
}

impl<E: Escrow> Keeper<E> {
    /// Open the engine, seeding params epoch 1 from `genesis` on an empty
    /// store. An existing store keeps its own params.
    pub fn new(store: StateStore, escrow: E, genesis: &EngineParams) -> KeeperResult<Self> {
        if store.latest_params()?.is_none() {
            genesis.validate()?;
            let mut batch = WriteBatch::new();
            batch.put_params_epoch(&ParamsEpoch {
                version: 1,
                effective_height: 0,
                params: genesis.clone(),
            })?;
            store.commit(batch)?;
            info!(denom = %genesis.denom, mode = ?genesis.routing.mode, "genesis params stored");
        }
        Ok(Self { store, escrow })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn escrow(&self) -> &E {
        &self.escrow
    }

    pub fn escrow_mut(&mut self) -> &mut E {
        &mut self.escrow
    }

    pub fn query(&self) -> Query<'_> {
        Query::new(&self.store)
    }

    /// Params of the current epoch.
    pub fn params(&self) -> KeeperResult<EngineParams> {
        self.store
            .latest_params()?
            .map(|epoch| epoch.params)
            .ok_or_else(|| KeeperError::not_found("params epoch", "latest"))
    }

    /// Apply one message at `ctx`. Returns the events it produced.
    pub fn apply(&mut self, ctx: &BlockContext, msg: Msg) -> KeeperResult<Vec<EngineEvent>> {
        let kind = msg.kind();
        let params = self.params()?;
        debug!(msg = kind, height = ctx.height, time = ctx.time, "applying message");

        let result = match msg {
            Msg::RegisterCluster(m) => self.register_cluster(ctx, m),
            Msg::UpdateCluster(m) => self.update_cluster(ctx, m),
            Msg::DeregisterCluster {
                provider,
                cluster_id,
            } => self.deregister_cluster(ctx, &provider, &cluster_id),
            Msg::UpdateClusterHealth(m) => self.update_cluster_health(ctx, m),
            Msg::CreateOffering(m) => self.create_offering(&params, ctx, m),
            Msg::UpdateOffering(m) => self.update_offering(&params, ctx, m),
            Msg::SetTemplateStatus {
                authority,
                template_id,
                status,
            } => self.set_template_status(&params, ctx, &authority, &template_id, status),
            Msg::SubmitJob(m) => self.submit_job(&params, ctx, m),
            Msg::ScheduleJob { sender, job_id } => self.schedule_job(&params, ctx, &sender, &job_id),
            Msg::PlaceJob {
                provider,
                job_id,
                cluster_id,
            } => self.place_job(&params, ctx, &provider, &job_id, &cluster_id),
            Msg::ReportStatus(m) => self.report_status(&params, ctx, m),
            Msg::CancelJob {
                sender,
                job_id,
                reason,
            } => self.cancel_job(&params, ctx, &sender, &job_id, reason.as_deref()),
            Msg::SubmitAccounting(m) => self.submit_accounting(&params, ctx, m),
            Msg::RecordUsageSnapshot(m) => self.record_usage_snapshot(&params, ctx, m),
            Msg::FlagDispute {
                sender,
                record_id,
                reason,
            } => self.flag_dispute(&params, ctx, &sender, &record_id, &reason),
            Msg::BeginReview {
                moderator,
                dispute_id,
            } => self.begin_review(&params, ctx, &moderator, &dispute_id),
            Msg::ResolveDispute {
                moderator,
                dispute_id,
                outcome,
            } => self.resolve_dispute(&params, ctx, &moderator, &dispute_id, outcome),
            Msg::UpdateParams { authority, params: next } => {
                self.update_params(&params, ctx, &authority, *next)
            }
        };

        match &result {
            Ok(events) => debug!(msg = kind, events = events.len(), "message applied"),
            Err(e) => warn!(msg = kind, class = ?e.class(), error = %e, "message rejected"),
        }
        result
    }

    /// Replace the params as a whole. Only the current authority may.
    fn update_params(
        &mut self,
        current: &EngineParams,
        ctx: &BlockContext,
        authority: &str,
        next: EngineParams,
    ) -> KeeperResult<Vec<EngineEvent>> {
        if authority != current.authority {
            return Err(KeeperError::Unauthorized {
                sender: authority.to_string(),
                action: "update params",
            });
        }
        next.validate()?;
        let version = self.store.latest_params()?.map(|e| e.version).unwrap_or(0) + 1;

        let mut tx = Tx::new();
        tx.batch.put_params_epoch(&ParamsEpoch {
            version,
            effective_height: ctx.height,
            params: next,
        })?;
        tx.emit(EngineEvent::ParamsUpdated {
            version,
            effective_height: ctx.height,
        });
        info!(version, height = ctx.height, "params replaced");
        tx.commit(&self.store)
    }
}
