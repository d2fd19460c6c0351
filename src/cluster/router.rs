//! Backend selection
//!
//! The candidates of a request are the available backends, narrowed by
//! an ordered chain of filters. An empty result is valid and means that
//! no backend is eligible.

use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use async_trait::async_trait;
use once_cell::sync::Lazy;

use super::{Backend, Cluster};
use crate::config_error;
use crate::core::{GatewayResult, RequestContext, RouterFilter};
use crate::protocol::Request;

pub const FILTER_LOOKUP: &str = "lookup";
pub const FILTER_REQUIRED_TAGS: &str = "required_tags";
pub const FILTER_SORT_LOAD: &str = "sort_load";
pub const FILTER_RESOURCE_RULES: &str = "resource_rules";

type FilterCreateFn = fn(&Cluster) -> Arc<dyn RouterFilter>;

static FILTER_BUILDER_REGISTRY: Lazy<HashMap<&'static str, FilterCreateFn>> = Lazy::new(|| {
    let arr: Vec<(&str, FilterCreateFn)> = vec![
        (FILTER_LOOKUP, create_lookup_filter),
        (FILTER_REQUIRED_TAGS, create_required_tags_filter),
        (FILTER_SORT_LOAD, create_sort_load_filter),
        (FILTER_RESOURCE_RULES, create_resource_rules_filter),
    ];
    arr.into_iter().collect()
});

fn create_lookup_filter(cluster: &Cluster) -> Arc<dyn RouterFilter> {
    Arc::new(LookupFilter {
        cluster: cluster.clone(),
    })
}

fn create_required_tags_filter(_: &Cluster) -> Arc<dyn RouterFilter> {
    Arc::new(RequiredTagsFilter)
}

fn create_sort_load_filter(_: &Cluster) -> Arc<dyn RouterFilter> {
    Arc::new(SortLoadFilter)
}

fn create_resource_rules_filter(_: &Cluster) -> Arc<dyn RouterFilter> {
    Arc::new(ResourceRulesFilter)
}

/// Build a filter by name. Unknown names are configuration errors.
pub fn build_filter(name: &str, cluster: &Cluster) -> GatewayResult<Arc<dyn RouterFilter>> {
    let builder = FILTER_BUILDER_REGISTRY
        .get(name)
        .ok_or_else(|| config_error!("Unknown router filter: {}", name))?;
    Ok(builder(cluster))
}

/// Selects backends for requests. Immutable after construction.
pub struct Router {
    cluster: Cluster,
    filters: Vec<Arc<dyn RouterFilter>>,
}

impl Router {
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            filters: Vec::new(),
        }
    }

    /// Router with the named filters, in order.
    pub fn with_filters<S: AsRef<str>>(cluster: Cluster, names: &[S]) -> GatewayResult<Self> {
        let mut router = Self::new(cluster);
        for name in names {
            let filter = build_filter(name.as_ref(), &router.cluster)?;
            router = router.use_filter(filter);
        }
        Ok(router)
    }

    /// Router with lookup, tag filtering, load sorting and resource rules.
    pub fn with_default_filters(cluster: Cluster) -> Self {
        let filters = [
            FILTER_LOOKUP,
            FILTER_REQUIRED_TAGS,
            FILTER_SORT_LOAD,
            FILTER_RESOURCE_RULES,
        ]
        .iter()
        .filter_map(|name| FILTER_BUILDER_REGISTRY.get(name).map(|b| b(&cluster)))
        .collect();
        Self { cluster, filters }
    }

    pub fn use_filter(mut self, filter: Arc<dyn RouterFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Run the available backends through the filter chain.
    pub async fn select_backends(
        &self,
        ctx: &RequestContext,
        req: &Request,
    ) -> GatewayResult<Vec<Backend>> {
        let mut backends = self.cluster.available_backends().await?;
        for filter in &self.filters {
            backends = filter.filter(ctx, &backends, req).await?;
            log::trace!("filter {} left {} backends", filter.name(), backends.len());
        }
        Ok(backends)
    }

    /// The first selected backend.
    pub async fn select_backend(
        &self,
        ctx: &RequestContext,
        req: &Request,
    ) -> GatewayResult<Option<Backend>> {
        Ok(self.select_backends(ctx, req).await?.into_iter().next())
    }

    /// The backend the request's meeting is bound to, whatever its state.
    pub async fn lookup_backend(&self, req: &Request) -> GatewayResult<Option<Backend>> {
        match req.params.meeting_id() {
            Some(meeting_id) => self.cluster.meeting_backend(meeting_id).await,
            None => Ok(None),
        }
    }
}

/// Collapse the candidates to the backend the meeting is bound to.
pub struct LookupFilter {
    cluster: Cluster,
}

#[async_trait]
impl RouterFilter for LookupFilter {
    fn name(&self) -> &'static str {
        FILTER_LOOKUP
    }

    async fn filter(
        &self,
        _ctx: &RequestContext,
        backends: &[Backend],
        req: &Request,
    ) -> GatewayResult<Vec<Backend>> {
        let Some(meeting_id) = req.params.meeting_id() else {
            return Ok(backends.to_vec());
        };
        let Some(meeting) = self.cluster.store().get_meeting(meeting_id).await? else {
            return Ok(backends.to_vec());
        };
        let Some(backend_id) = meeting.backend_id else {
            return Ok(backends.to_vec());
        };

        match backends.iter().find(|b| b.id() == backend_id) {
            Some(backend) => Ok(vec![backend.clone()]),
            None => {
                log::warn!(
                    meeting_id = meeting_id, backend = backend_id.as_str();
                    "bound backend is not a candidate, using all candidates"
                );
                Ok(backends.to_vec())
            }
        }
    }
}

/// Drop backends lacking any tag the frontend requires.
pub struct RequiredTagsFilter;

#[async_trait]
impl RouterFilter for RequiredTagsFilter {
    fn name(&self) -> &'static str {
        FILTER_REQUIRED_TAGS
    }

    async fn filter(
        &self,
        ctx: &RequestContext,
        backends: &[Backend],
        _req: &Request,
    ) -> GatewayResult<Vec<Backend>> {
        let required = ctx
            .frontend
            .as_ref()
            .map(|f| f.settings.required_tags.as_slice())
            .unwrap_or_default();
        Ok(backends
            .iter()
            .filter(|b| b.state.has_tags(required))
            .cloned()
            .collect())
    }
}

/// Order backends by stress, least loaded first.
pub struct SortLoadFilter;

#[async_trait]
impl RouterFilter for SortLoadFilter {
    fn name(&self) -> &'static str {
        FILTER_SORT_LOAD
    }

    async fn filter(
        &self,
        _ctx: &RequestContext,
        backends: &[Backend],
        _req: &Request,
    ) -> GatewayResult<Vec<Backend>> {
        let mut sorted = backends.to_vec();
        sorted.sort_by(|a, b| {
            a.stress()
                .partial_cmp(&b.stress())
                .unwrap_or(Ordering::Equal)
        });
        Ok(sorted)
    }
}

/// Keep every backend for fleet wide resources, otherwise the first.
pub struct ResourceRulesFilter;

#[async_trait]
impl RouterFilter for ResourceRulesFilter {
    fn name(&self) -> &'static str {
        FILTER_RESOURCE_RULES
    }

    async fn filter(
        &self,
        _ctx: &RequestContext,
        backends: &[Backend],
        req: &Request,
    ) -> GatewayResult<Vec<Backend>> {
        if req.resource.fans_out() {
            Ok(backends.to_vec())
        } else {
            Ok(backends.iter().take(1).cloned().collect())
        }
    }
}
