use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Mirror a catalog product. Re-registering an id updates it in place.
    /// An active product gets a zero ledger row at every active branch.
    pub async fn register_product(
        &self,
        id: Ulid,
        name: String,
        category: Option<String>,
        price_cents: i64,
        active: bool,
    ) -> Result<Vec<StockKey>, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Invalid("product name is required".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("product name too long"));
        }
        if let Some(ref c) = category
            && c.len() > MAX_CATEGORY_LEN
        {
            return Err(EngineError::LimitExceeded("category too long"));
        }
        if price_cents < 0 {
            return Err(EngineError::Invalid("price must not be negative".into()));
        }
        if price_cents > MAX_PRICE_CENTS {
            return Err(EngineError::LimitExceeded("price too high"));
        }
        if !self.catalog.has_product(&id) && self.catalog.product_count() >= MAX_PRODUCTS {
            return Err(EngineError::LimitExceeded("too many products"));
        }

        let _gate = self.commit_gate.read().await;
        let event = Event::ProductRegistered {
            id,
            name,
            category,
            price_cents,
            active,
        };
        self.wal_append(&event).await?;
        self.apply_directory_event(&event);

        let mut opened = Vec::new();
        if active {
            for branch_id in self.catalog.active_branch_ids() {
                let key = StockKey::new(id, branch_id);
                if self.get_row(&key).is_none() {
                    self.open_row(key).await?;
                    opened.push(key);
                }
            }
        }
        info!(product = %id, rows_opened = opened.len(), "registered product");
        Ok(opened)
    }

    pub async fn set_product_active(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        if !self.catalog.has_product(&id) {
            return Err(EngineError::NotFound(id));
        }
        let _gate = self.commit_gate.read().await;
        let event = Event::ProductActiveSet { id, active };
        self.wal_append(&event).await?;
        self.apply_directory_event(&event);
        info!(product = %id, active, "product active flag changed");
        Ok(())
    }

    /// Mirror a branch. Registering a branch opens no ledger rows; they are
    /// created on first stock assignment.
    pub async fn register_branch(
        &self,
        id: Ulid,
        code: String,
        name: String,
        active: bool,
    ) -> Result<(), EngineError> {
        if code.trim().is_empty() || name.trim().is_empty() {
            return Err(EngineError::Invalid("branch code and name are required".into()));
        }
        if code.len() > MAX_CODE_LEN {
            return Err(EngineError::LimitExceeded("branch code too long"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("branch name too long"));
        }
        if !self.catalog.has_branch(&id) && self.catalog.branch_count() >= MAX_BRANCHES {
            return Err(EngineError::LimitExceeded("too many branches"));
        }

        let _gate = self.commit_gate.read().await;
        let event = Event::BranchRegistered { id, code, name, active };
        self.wal_append(&event).await?;
        self.apply_directory_event(&event);
        info!(branch = %id, "registered branch");
        Ok(())
    }

    pub async fn set_branch_active(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        if !self.catalog.has_branch(&id) {
            return Err(EngineError::NotFound(id));
        }
        let _gate = self.commit_gate.read().await;
        let event = Event::BranchActiveSet { id, active };
        self.wal_append(&event).await?;
        self.apply_directory_event(&event);
        if !active {
            self.notify.remove_branch(&id);
        }
        info!(branch = %id, active, "branch active flag changed");
        Ok(())
    }

    /// Shared by live writes and replay.
    pub(super) fn apply_directory_event(&self, event: &Event) {
        match event {
            Event::ProductRegistered {
                id,
                name,
                category,
                price_cents,
                active,
            } => self.catalog.upsert_product(ProductInfo {
                id: *id,
                name: name.clone(),
                category: category.clone(),
                price_cents: *price_cents,
                active: *active,
            }),
            Event::ProductActiveSet { id, active } => {
                self.catalog.set_product_active(*id, *active);
            }
            Event::BranchRegistered { id, code, name, active } => self.catalog.upsert_branch(BranchInfo {
                id: *id,
                code: code.clone(),
                name: name.clone(),
                active: *active,
            }),
            Event::BranchActiveSet { id, active } => {
                self.catalog.set_branch_active(*id, *active);
            }
            _ => {}
        }
    }
}
