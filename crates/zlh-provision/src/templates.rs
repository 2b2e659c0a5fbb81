use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use zlh_db::entities::templates;
use zlh_model::InstanceClass;

use crate::config::ResourceDefaults;
use crate::error::{ProvisionError, Result};

/// Per-request resource overrides. Each field beats the template default.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    #[serde(default, alias = "cpuCores")]
    pub cpu: Option<i32>,
    #[serde(default, alias = "memoryMiB", alias = "memory")]
    pub memory_mib: Option<i32>,
    #[serde(default, alias = "diskGiB", alias = "disk")]
    pub disk_gib: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub cpu: i32,
    pub memory_mib: i32,
    pub disk_gib: i32,
}

pub const CPU_MIN: i32 = 1;
pub const CPU_MAX: i32 = 3;

/// Request > template > fallback, with cpu clamped regardless of source.
pub fn merge_resources(
    req: &ResourceRequest,
    template: Option<&templates::Model>,
    defaults: &ResourceDefaults,
) -> Resources {
    let cpu = req
        .cpu
        .or_else(|| template.and_then(|t| t.default_cpu))
        .unwrap_or(defaults.cpu);
    Resources {
        cpu: cpu.clamp(CPU_MIN, CPU_MAX),
        memory_mib: req
            .memory_mib
            .or_else(|| template.and_then(|t| t.default_memory_mib))
            .unwrap_or(defaults.memory_mib),
        disk_gib: req
            .disk_gib
            .or_else(|| template.and_then(|t| t.default_disk_gib))
            .unwrap_or(defaults.disk_gib),
    }
}

pub fn pick_bridge(
    class: InstanceClass,
    template: Option<&templates::Model>,
    defaults: &ResourceDefaults,
) -> String {
    template
        .and_then(|t| t.bridge.clone())
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| defaults.bridge_for(class).to_string())
}

/// Everything the lifecycle driver needs to build a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blueprint {
    pub slug: Option<String>,
    pub base_image_id: i32,
    pub resources: Resources,
    /// Disk size baked into the base image; resize only grows past it.
    pub base_disk_gib: i32,
    pub bridge: String,
    pub storage: String,
}

impl Blueprint {
    pub fn build(
        class: InstanceClass,
        template: Option<&templates::Model>,
        req: &ResourceRequest,
        storage: Option<&str>,
        defaults: &ResourceDefaults,
    ) -> Self {
        Blueprint {
            slug: template.map(|t| t.slug.clone()),
            base_image_id: template.map_or(defaults.base_image_id, |t| t.base_image_id),
            resources: merge_resources(req, template, defaults),
            base_disk_gib: template
                .and_then(|t| t.default_disk_gib)
                .unwrap_or(defaults.disk_gib),
            bridge: pick_bridge(class, template, defaults),
            storage: storage
                .map(str::to_string)
                .or_else(|| template.and_then(|t| t.storage.clone()))
                .unwrap_or_else(|| defaults.storage.clone()),
        }
    }

    pub fn needs_resize(&self) -> bool {
        self.resources.disk_gib > self.base_disk_gib
    }
}

#[derive(Clone)]
pub struct TemplateResolver {
    db: DatabaseConnection,
}

impl TemplateResolver {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// A named slug must exist. Without one, the first template matching
    /// (workload, variant) is used when there is one.
    pub async fn resolve(
        &self,
        slug: Option<&str>,
        workload: Option<&str>,
        variant: Option<&str>,
    ) -> Result<Option<templates::Model>> {
        if let Some(slug) = slug {
            return templates::Entity::find_by_id(slug.to_string())
                .one(&self.db)
                .await?
                .map(Some)
                .ok_or_else(|| ProvisionError::TemplateNotFound(slug.to_string()));
        }

        let Some(workload) = workload else {
            return Ok(None);
        };
        let mut q = templates::Entity::find().filter(templates::Column::Workload.eq(workload));
        q = match variant {
            Some(v) => q.filter(templates::Column::Variant.eq(v)),
            None => q.filter(templates::Column::Variant.is_null()),
        };
        Ok(q.order_by_asc(templates::Column::Slug).one(&self.db).await?)
    }
}
