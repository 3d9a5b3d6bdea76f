use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validation::validate_service;
use super::{Engine, EngineError, LockedDays};

impl Engine {
    pub async fn add_service(
        &self,
        id: Ulid,
        name: &str,
        duration_minutes: Minutes,
        active: bool,
    ) -> Result<Service, EngineError> {
        let name = name.trim();
        validate_service(name, duration_minutes)?;

        let _gate = self.snapshot_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.services.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }

        let service = Service {
            id,
            name: name.to_string(),
            duration_minutes,
            active,
        };
        let event = Event::ServiceAdded {
            service: service.clone(),
        };
        self.persist_and_apply(&event, &mut LockedDays::none()).await?;
        info!(%id, name, duration_minutes, "service added");
        Ok(service)
    }

    /// Stop offering a service. Existing appointments keep their snapshotted
    /// duration; new bookings that name it are refused.
    pub async fn deactivate_service(&self, id: Ulid) -> Result<Service, EngineError> {
        let _gate = self.snapshot_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        let service = self
            .services
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        if !service.active {
            return Ok(service);
        }

        let event = Event::ServiceDeactivated { id };
        self.persist_and_apply(&event, &mut LockedDays::none()).await?;
        info!(%id, "service deactivated");
        Ok(Service {
            active: false,
            ..service
        })
    }

    /// Services ordered by name. Inactive ones only when asked for.
    pub fn list_services(&self, include_inactive: bool) -> Vec<Service> {
        let mut services: Vec<Service> = self
            .services
            .iter()
            .filter(|s| include_inactive || s.active)
            .map(|s| s.value().clone())
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        services
    }

    pub fn get_service(&self, id: Ulid) -> Option<Service> {
        self.services.get(&id).map(|s| s.value().clone())
    }

    /// Total duration and display names of the given services.
    pub(super) fn resolve_services(
        &self,
        ids: &[Ulid],
        allow_inactive: bool,
    ) -> Result<(Minutes, Vec<String>), EngineError> {
        let mut total = 0;
        let mut names = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            // A service listed twice is still done once.
            if ids[..i].contains(id) {
                continue;
            }
            let service = self
                .services
                .get(id)
                .ok_or(EngineError::UnknownService(*id))?;
            if !service.active && !allow_inactive {
                return Err(EngineError::InactiveService(*id));
            }
            total += service.duration_minutes;
            names.push(service.name.clone());
        }
        Ok((total, names))
    }

    pub(super) fn service_names(&self, ids: &[Ulid]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.services.get(id).map(|s| s.name.clone()))
            .collect()
    }
}
