use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::request::{validate_name, CreateBranchRequest, CreateVenueRequest};

use super::conflict::require_admin;
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_branch(&self, req: CreateBranchRequest, actor: &Actor) -> Result<Branch, EngineError> {
        require_admin(actor)?;
        validate_name(&req.name)?;
        let _registry = self.registry_lock.lock().await;
        if self.store.branch_count() >= MAX_BRANCHES {
            return Err(EngineError::LimitExceeded("too many branches"));
        }

        let branch = Branch { id: Ulid::new(), name: req.name.trim().to_string() };
        self.wal_append(&Event::BranchCreated { id: branch.id, name: branch.name.clone() })
            .await?;
        self.store.insert_branch(branch.clone());
        info!(branch_id = %branch.id, "branch {:?} created", branch.name);
        Ok(branch)
    }

    pub async fn create_venue(&self, req: CreateVenueRequest, actor: &Actor) -> Result<Venue, EngineError> {
        require_admin(actor)?;
        validate_name(&req.name)?;
        let _registry = self.registry_lock.lock().await;
        if self.store.get_branch(&req.branch_id).is_none() {
            return Err(EngineError::NotFound(req.branch_id));
        }
        if self.store.venue_count() >= MAX_VENUES {
            return Err(EngineError::LimitExceeded("too many venues"));
        }

        let venue = Venue {
            id: Ulid::new(),
            branch_id: req.branch_id,
            name: req.name.trim().to_string(),
        };
        self.wal_append(&Event::VenueCreated {
            id: venue.id,
            branch_id: venue.branch_id,
            name: venue.name.clone(),
        })
        .await?;
        self.store.insert_venue(venue.clone());
        info!(venue_id = %venue.id, branch_id = %venue.branch_id, "venue {:?} created", venue.name);
        Ok(venue)
    }
}
