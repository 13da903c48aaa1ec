//! Cluster, offering and template registry handlers.

use tracing::info;

use hpc_core::{BlockContext, DecCoin, EngineParams};
use hpcgrid_settlement::Escrow;
use hpcgrid_state::{
    ClusterStatus, HPCCluster, HPCOffering, TemplateStatus, WorkloadTemplate,
};
use rust_decimal::Decimal;

use crate::error::{KeeperError, KeeperResult};
use crate::events::EngineEvent;
use crate::keeper::{Keeper, Tx};
use crate::msg::{CreateOffering, RegisterCluster, UpdateCluster, UpdateClusterHealth, UpdateOffering};

fn require_non_empty(field: &str, value: &str) -> KeeperResult<()> {
    if value.trim().is_empty() {
        return Err(KeeperError::Invalid(format!("{field} is required")));
    }
    Ok(())
}

fn check_reliability(bps: u32) -> KeeperResult<()> {
    if bps > 10_000 {
        return Err(KeeperError::Invalid(format!(
            "reliability {bps} bps is over 10000"
        )));
    }
    Ok(())
}

/// Parse a price and check it is strictly positive and in the engine denom.
fn parse_price(raw: &str, params: &EngineParams) -> KeeperResult<DecCoin> {
    let price = DecCoin::parse(raw)?;
    if price.denom != params.denom {
        return Err(KeeperError::Invalid(format!(
            "price denom {} is not {}",
            price.denom, params.denom
        )));
    }
    if price.amount <= Decimal::ZERO {
        return Err(KeeperError::Invalid(format!("price {raw} must be positive")));
    }
    Ok(price)
}

fn check_duration_window(min: u64, max: u64) -> KeeperResult<()> {
    if max == 0 {
        return Err(KeeperError::Invalid("max duration must be positive".to_string()));
    }
    if min > max {
        return Err(KeeperError::Invalid(format!(
            "min duration {min}s exceeds max duration {max}s"
        )));
    }
    Ok(())
}

impl<E: Escrow> Keeper<E> {
    /// Load a cluster the sender owns.
    fn owned_cluster(&self, provider: &str, cluster_id: &str, action: &'static str) -> KeeperResult<HPCCluster> {
        let cluster = self
            .store
            .get_cluster(cluster_id)?
            .ok_or_else(|| KeeperError::not_found("cluster", cluster_id))?;
        if cluster.provider != provider {
            return Err(KeeperError::Unauthorized {
                sender: provider.to_string(),
                action,
            });
        }
        Ok(cluster)
    }

    pub(crate) fn register_cluster(
        &mut self,
        ctx: &BlockContext,
        m: RegisterCluster,
    ) -> KeeperResult<Vec<EngineEvent>> {
        require_non_empty("provider", &m.provider)?;
        require_non_empty("cluster id", &m.cluster_id)?;
        require_non_empty("region", &m.region)?;
        if m.cluster_id.contains(['/', ':']) {
            return Err(KeeperError::Invalid(format!(
                "cluster id {} may not contain '/' or ':'",
                m.cluster_id
            )));
        }
        check_reliability(m.reliability_bps)?;
        if self.store.get_cluster(&m.cluster_id)?.is_some() {
            return Err(KeeperError::AlreadyExists {
                kind: "cluster",
                id: m.cluster_id,
            });
        }

        let cluster = HPCCluster {
            id: m.cluster_id,
            provider: m.provider,
            name: m.name,
            region: m.region,
            latency_ms: m.latency_ms,
            total_nodes: m.total_nodes,
            available_nodes: m.total_nodes,
            total_gpus: m.total_gpus,
            available_gpus: m.total_gpus,
            reliability_bps: m.reliability_bps,
            node_operators: m.node_operators,
            status: ClusterStatus::Active,
            created_height: ctx.height,
            updated_height: ctx.height,
        };

        let mut tx = Tx::new();
        tx.batch.put_cluster(&cluster)?;
        tx.emit(EngineEvent::ClusterRegistered {
            cluster_id: cluster.id.clone(),
            provider: cluster.provider.clone(),
        });
        info!(
            cluster = %cluster.id,
            provider = %cluster.provider,
            region = %cluster.region,
            nodes = cluster.total_nodes,
            gpus = cluster.total_gpus,
            "cluster registered"
        );
        tx.commit(&self.store)
    }

    pub(crate) fn update_cluster(
        &mut self,
        ctx: &BlockContext,
        m: UpdateCluster,
    ) -> KeeperResult<Vec<EngineEvent>> {
        let mut cluster = self.owned_cluster(&m.provider, &m.cluster_id, "update cluster")?;
        if cluster.status == ClusterStatus::Deregistered {
            return Err(KeeperError::Invalid(format!(
                "cluster {} is deregistered",
                cluster.id
            )));
        }

        if let Some(name) = m.name {
            cluster.name = name;
        }
        if let Some(region) = m.region {
            require_non_empty("region", &region)?;
            cluster.region = region;
        }
        if let Some(latency) = m.latency_ms {
            cluster.latency_ms = latency;
        }
        if let Some(operators) = m.node_operators {
            cluster.node_operators = operators;
        }
        // Totals may shrink only down to what running jobs hold.
        if let Some(total) = m.total_nodes {
            let allocated = cluster.total_nodes - cluster.available_nodes;
            if total < allocated {
                return Err(KeeperError::Invalid(format!(
                    "{total} nodes is below the {allocated} allocated"
                )));
            }
            cluster.total_nodes = total;
            cluster.available_nodes = total - allocated;
        }
        if let Some(total) = m.total_gpus {
            let allocated = cluster.total_gpus - cluster.available_gpus;
            if total < allocated {
                return Err(KeeperError::Invalid(format!(
                    "{total} gpus is below the {allocated} allocated"
                )));
            }
            cluster.total_gpus = total;
            cluster.available_gpus = total - allocated;
        }
        cluster.updated_height = ctx.height;

        let mut tx = Tx::new();
        tx.batch.put_cluster(&cluster)?;
        tx.emit(EngineEvent::ClusterUpdated {
            cluster_id: cluster.id.clone(),
        });
        info!(
            cluster = %cluster.id,
            nodes = cluster.total_nodes,
            available_nodes = cluster.available_nodes,
            "cluster updated"
        );
        tx.commit(&self.store)
    }

    pub(crate) fn deregister_cluster(
        &mut self,
        ctx: &BlockContext,
        provider: &str,
        cluster_id: &str,
    ) -> KeeperResult<Vec<EngineEvent>> {
        let mut cluster = self.owned_cluster(provider, cluster_id, "deregister cluster")?;
        if cluster.status == ClusterStatus::Deregistered {
            return Ok(Vec::new());
        }

        let mut active = 0;
        for job_id in self.store.list_active_job_ids()? {
            if let Some(job) = self.store.get_job(&job_id)? {
                if job.cluster_id.as_deref() == Some(cluster_id) {
                    active += 1;
                }
            }
        }
        if active > 0 {
            return Err(KeeperError::ClusterHasActiveJobs {
                cluster_id: cluster_id.to_string(),
                active,
            });
        }

        cluster.status = ClusterStatus::Deregistered;
        cluster.updated_height = ctx.height;

        let mut tx = Tx::new();
        tx.batch.put_cluster(&cluster)?;
        for mut offering in self.store.list_offerings_for_cluster(cluster_id)? {
            if offering.active {
                offering.active = false;
                offering.updated_height = ctx.height;
                tx.batch.put_offering(&offering)?;
            }
        }
        tx.emit(EngineEvent::ClusterDeregistered {
            cluster_id: cluster.id.clone(),
        });
        info!(cluster = %cluster.id, "cluster deregistered");
        tx.commit(&self.store)
    }

    /// Apply the aggregated node-agent feed. The feed is verified upstream.
    pub(crate) fn update_cluster_health(
        &mut self,
        ctx: &BlockContext,
        m: UpdateClusterHealth,
    ) -> KeeperResult<Vec<EngineEvent>> {
        let mut cluster = self
            .store
            .get_cluster(&m.cluster_id)?
            .ok_or_else(|| KeeperError::not_found("cluster", &m.cluster_id))?;
        if cluster.status == ClusterStatus::Deregistered {
            return Err(KeeperError::Invalid(format!(
                "cluster {} is deregistered",
                cluster.id
            )));
        }
        if let Some(status) = m.status {
            if status == ClusterStatus::Deregistered {
                return Err(KeeperError::Invalid(
                    "health feed cannot deregister a cluster".to_string(),
                ));
            }
            cluster.status = status;
        }
        if let Some(bps) = m.reliability_bps {
            check_reliability(bps)?;
            cluster.reliability_bps = bps;
        }
        cluster.updated_height = ctx.height;

        let mut tx = Tx::new();
        tx.batch.put_cluster(&cluster)?;
        tx.emit(EngineEvent::ClusterHealthUpdated {
            cluster_id: cluster.id.clone(),
            status: cluster.status,
            reliability_bps: cluster.reliability_bps,
        });
        info!(
            cluster = %cluster.id,
            status = ?cluster.status,
            reliability = cluster.reliability_bps,
            "cluster health updated"
        );
        tx.commit(&self.store)
    }

    pub(crate) fn create_offering(
        &mut self,
        params: &EngineParams,
        ctx: &BlockContext,
        m: CreateOffering,
    ) -> KeeperResult<Vec<EngineEvent>> {
        let cluster = self.owned_cluster(&m.provider, &m.cluster_id, "create offering")?;
        if cluster.status == ClusterStatus::Deregistered {
            return Err(KeeperError::Invalid(format!(
                "cluster {} is deregistered",
                cluster.id
            )));
        }
        require_non_empty("offering name", &m.name)?;
        if !m.resource_type.is_schedulable() {
            return Err(KeeperError::Invalid(format!(
                "offerings are priced per node or gpu, not {}",
                m.resource_type.label()
            )));
        }
        let price = parse_price(&m.price_per_hour, params)?;
        check_duration_window(m.min_duration_secs, m.max_duration_secs)?;

        let id = HPCOffering::make_id(&cluster.id, &m.name);
        if self.store.get_offering(&id)?.is_some() {
            return Err(KeeperError::AlreadyExists { kind: "offering", id });
        }

        let offering = HPCOffering {
            id,
            cluster_id: cluster.id,
            name: m.name,
            resource_type: m.resource_type,
            gpu_model: m.gpu_model,
            price_per_hour: price,
            min_duration_secs: m.min_duration_secs,
            max_duration_secs: m.max_duration_secs,
            active: true,
            created_height: ctx.height,
            updated_height: ctx.height,
        };

        let mut tx = Tx::new();
        tx.batch.put_offering(&offering)?;
        tx.emit(EngineEvent::OfferingCreated {
            offering_id: offering.id.clone(),
        });
        info!(
            offering = %offering.id,
            kind = offering.resource_type.label(),
            price = %offering.price_per_hour.amount,
            "offering created"
        );
        tx.commit(&self.store)
    }

    pub(crate) fn update_offering(
        &mut self,
        params: &EngineParams,
        ctx: &BlockContext,
        m: UpdateOffering,
    ) -> KeeperResult<Vec<EngineEvent>> {
        let mut offering = self
            .store
            .get_offering(&m.offering_id)?
            .ok_or_else(|| KeeperError::not_found("offering", &m.offering_id))?;
        let cluster = self.owned_cluster(&m.provider, &offering.cluster_id, "update offering")?;

        if let Some(raw) = &m.price_per_hour {
            offering.price_per_hour = parse_price(raw, params)?;
        }
        if let Some(min) = m.min_duration_secs {
            offering.min_duration_secs = min;
        }
        if let Some(max) = m.max_duration_secs {
            offering.max_duration_secs = max;
        }
        check_duration_window(offering.min_duration_secs, offering.max_duration_secs)?;
        if let Some(active) = m.active {
            if active && cluster.status == ClusterStatus::Deregistered {
                return Err(KeeperError::Invalid(format!(
                    "cluster {} is deregistered",
                    cluster.id
                )));
            }
            offering.active = active;
        }
        offering.updated_height = ctx.height;

        let mut tx = Tx::new();
        tx.batch.put_offering(&offering)?;
        tx.emit(EngineEvent::OfferingUpdated {
            offering_id: offering.id.clone(),
        });
        info!(offering = %offering.id, active = offering.active, "offering updated");
        tx.commit(&self.store)
    }

    /// Governance feed for workload templates.
    pub(crate) fn set_template_status(
        &mut self,
        params: &EngineParams,
        ctx: &BlockContext,
        authority: &str,
        template_id: &str,
        status: TemplateStatus,
    ) -> KeeperResult<Vec<EngineEvent>> {
        if authority != params.authority {
            return Err(KeeperError::Unauthorized {
                sender: authority.to_string(),
                action: "set template status",
            });
        }
        require_non_empty("template id", template_id)?;

        let template = WorkloadTemplate {
            id: template_id.to_string(),
            status,
            updated_height: ctx.height,
        };
        let mut tx = Tx::new();
        tx.batch.put_template(&template)?;
        tx.emit(EngineEvent::TemplateStatusChanged {
            template_id: template.id.clone(),
            status,
        });
        info!(template = %template.id, ?status, "template status changed");
        tx.commit(&self.store)
    }
}

#[cfg(test)]
mod tests {
    use hpc_core::ResourceKind;
    use hpcgrid_settlement::InMemoryEscrow;
    use hpcgrid_state::StateStore;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::msg::Msg;

    fn keeper() -> Keeper<InMemoryEscrow> {
        let params = EngineParams {
            authority: "gov".to_string(),
            ..Default::default()
        };
        Keeper::new(StateStore::open_in_memory().unwrap(), InMemoryEscrow::new(), &params).unwrap()
    }

    fn register(id: &str, nodes: u32) -> Msg {
        Msg::RegisterCluster(RegisterCluster {
            provider: "provider1".to_string(),
            cluster_id: id.to_string(),
            name: id.to_string(),
            region: "us-east".to_string(),
            latency_ms: Default::default(),
            total_nodes: nodes,
            total_gpus: 0,
            reliability_bps: 10_000,
            node_operators: Vec::new(),
        })
    }

    fn offering(price: &str, min: u64, max: u64) -> Msg {
        Msg::CreateOffering(CreateOffering {
            provider: "provider1".to_string(),
            cluster_id: "c1".to_string(),
            name: "std".to_string(),
            resource_type: ResourceKind::Node,
            gpu_model: None,
            price_per_hour: price.to_string(),
            min_duration_secs: min,
            max_duration_secs: max,
        })
    }

    fn ctx() -> BlockContext {
        BlockContext::new(1, 100)
    }

    #[test]
    fn register_and_reject_duplicates() {
        let mut k = keeper();
        let events = k.apply(&ctx(), register("c1", 10)).unwrap();
        assert_eq!(
            events,
            vec![EngineEvent::ClusterRegistered {
                cluster_id: "c1".to_string(),
                provider: "provider1".to_string()
            }]
        );
        let c = k.store().get_cluster("c1").unwrap().unwrap();
        assert_eq!(c.available_nodes, 10);
        assert!(c.is_active());

        let err = k.apply(&ctx(), register("c1", 5)).unwrap_err();
        assert!(matches!(err, KeeperError::AlreadyExists { .. }));
    }

    #[test]
    fn offering_validation() {
        let mut k = keeper();
        k.apply(&ctx(), register("c1", 10)).unwrap();

        let err = k.apply(&ctx(), offering("0uve", 60, 3_600)).unwrap_err();
        assert!(matches!(err, KeeperError::Invalid(_)));
        let err = k.apply(&ctx(), offering("12.5uve", 7_200, 3_600)).unwrap_err();
        assert!(matches!(err, KeeperError::Invalid(_)));
        let err = k.apply(&ctx(), offering("12.5atom", 60, 3_600)).unwrap_err();
        assert!(matches!(err, KeeperError::Invalid(_)));

        k.apply(&ctx(), offering("12.5uve", 60, 3_600)).unwrap();
        let o = k.store().get_offering("c1/std").unwrap().unwrap();
        assert_eq!(o.price_per_hour.amount, dec!(12.5));
        assert!(o.active);
    }

    #[test]
    fn only_owner_may_edit() {
        let mut k = keeper();
        k.apply(&ctx(), register("c1", 10)).unwrap();
        let err = k
            .apply(
                &ctx(),
                Msg::UpdateCluster(UpdateCluster {
                    provider: "mallory".to_string(),
                    cluster_id: "c1".to_string(),
                    total_nodes: Some(1),
                    ..Default::default()
                }),
            )
            .unwrap_err();
        assert!(matches!(err, KeeperError::Unauthorized { .. }));
    }

    #[test]
    fn shrinking_respects_allocations() {
        let mut k = keeper();
        k.apply(&ctx(), register("c1", 10)).unwrap();
        let mut c = k.store().get_cluster("c1").unwrap().unwrap();
        c.allocate(6, 0).unwrap();
        let mut batch = hpcgrid_state::WriteBatch::new();
        batch.put_cluster(&c).unwrap();
        k.store().commit(batch).unwrap();

        let shrink = |nodes| {
            Msg::UpdateCluster(UpdateCluster {
                provider: "provider1".to_string(),
                cluster_id: "c1".to_string(),
                total_nodes: Some(nodes),
                ..Default::default()
            })
        };
        assert!(k.apply(&ctx(), shrink(5)).is_err());
        k.apply(&ctx(), shrink(8)).unwrap();
        let c = k.store().get_cluster("c1").unwrap().unwrap();
        assert_eq!((c.total_nodes, c.available_nodes), (8, 2));
        assert!(c.capacity_consistent());
    }

    #[test]
    fn deregister_deactivates_offerings_and_health_cannot_revive() {
        let mut k = keeper();
        k.apply(&ctx(), register("c1", 10)).unwrap();
        k.apply(&ctx(), offering("12.5uve", 60, 3_600)).unwrap();
        k.apply(
            &ctx(),
            Msg::DeregisterCluster {
                provider: "provider1".to_string(),
                cluster_id: "c1".to_string(),
            },
        )
        .unwrap();
        assert!(!k.store().get_offering("c1/std").unwrap().unwrap().active);

        let err = k
            .apply(
                &ctx(),
                Msg::UpdateClusterHealth(UpdateClusterHealth {
                    cluster_id: "c1".to_string(),
                    status: Some(ClusterStatus::Active),
                    reliability_bps: None,
                }),
            )
            .unwrap_err();
        assert!(matches!(err, KeeperError::Invalid(_)));
    }

    #[test]
    fn health_feed_updates_status_and_reliability() {
        let mut k = keeper();
        k.apply(&ctx(), register("c1", 10)).unwrap();
        k.apply(
            &ctx(),
            Msg::UpdateClusterHealth(UpdateClusterHealth {
                cluster_id: "c1".to_string(),
                status: Some(ClusterStatus::Unavailable),
                reliability_bps: Some(7_500),
            }),
        )
        .unwrap();
        let c = k.store().get_cluster("c1").unwrap().unwrap();
        assert_eq!(c.status, ClusterStatus::Unavailable);
        assert_eq!(c.reliability_bps, 7_500);
    }

    #[test]
    fn templates_are_authority_gated() {
        let mut k = keeper();
        let msg = |authority: &str| Msg::SetTemplateStatus {
            authority: authority.to_string(),
            template_id: "tpl-1".to_string(),
            status: TemplateStatus::Approved,
        };
        assert!(k.apply(&ctx(), msg("mallory")).is_err());
        k.apply(&ctx(), msg("gov")).unwrap();
        assert_eq!(
            k.store().get_template("tpl-1").unwrap().unwrap().status,
            TemplateStatus::Approved
        );
    }
}
