use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{BranchInfo, ProductInfo};

/// Read-only mirror of the product catalog and branch directory.
///
/// The owning systems live elsewhere; the ledger only needs existence and the
/// active flag to decide whether a product/branch pair is a valid target.
#[derive(Default)]
pub struct Catalog {
    products: DashMap<Ulid, ProductInfo>,
    branches: DashMap<Ulid, BranchInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetError {
    UnknownProduct(Ulid),
    InactiveProduct(Ulid),
    UnknownBranch(Ulid),
    InactiveBranch(Ulid),
}

impl std::fmt::Display for TargetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetError::UnknownProduct(id) => write!(f, "unknown product {id}"),
            TargetError::InactiveProduct(id) => write!(f, "product {id} is inactive"),
            TargetError::UnknownBranch(id) => write!(f, "unknown branch {id}"),
            TargetError::InactiveBranch(id) => write!(f, "branch {id} is inactive"),
        }
    }
}

impl std::error::Error for TargetError {}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_product(&self, info: ProductInfo) {
        self.products.insert(info.id, info);
    }

    pub fn upsert_branch(&self, info: BranchInfo) {
        self.branches.insert(info.id, info);
    }

    /// Returns false when the product is unknown.
    pub fn set_product_active(&self, id: Ulid, active: bool) -> bool {
        match self.products.get_mut(&id) {
            Some(mut p) => {
                p.active = active;
                true
            }
            None => false,
        }
    }

    pub fn set_branch_active(&self, id: Ulid, active: bool) -> bool {
        match self.branches.get_mut(&id) {
            Some(mut b) => {
                b.active = active;
                true
            }
            None => false,
        }
    }

    pub fn product(&self, id: &Ulid) -> Option<ProductInfo> {
        self.products.get(id).map(|p| p.value().clone())
    }

    pub fn branch(&self, id: &Ulid) -> Option<BranchInfo> {
        self.branches.get(id).map(|b| b.value().clone())
    }

    pub fn has_product(&self, id: &Ulid) -> bool {
        self.products.contains_key(id)
    }

    pub fn has_branch(&self, id: &Ulid) -> bool {
        self.branches.contains_key(id)
    }

    pub fn product_count(&self) -> usize {
        self.products.len()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    pub fn price_cents(&self, id: &Ulid) -> Option<i64> {
        self.products.get(id).map(|p| p.price_cents)
    }

    /// Sorted, so bulk row creation is deterministic.
    pub fn active_branch_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .branches
            .iter()
            .filter(|b| b.active)
            .map(|b| *b.key())
            .collect();
        ids.sort();
        ids
    }

    pub fn products(&self) -> Vec<ProductInfo> {
        let mut all: Vec<ProductInfo> = self.products.iter().map(|p| p.value().clone()).collect();
        all.sort_by_key(|p| p.id);
        all
    }

    pub fn branches(&self) -> Vec<BranchInfo> {
        let mut all: Vec<BranchInfo> = self.branches.iter().map(|b| b.value().clone()).collect();
        all.sort_by_key(|b| b.id);
        all
    }

    /// Both ends of a stock key must exist and be active.
    pub fn check_target(&self, product_id: Ulid, branch_id: Ulid) -> Result<(), TargetError> {
        match self.products.get(&product_id) {
            None => return Err(TargetError::UnknownProduct(product_id)),
            Some(p) if !p.active => return Err(TargetError::InactiveProduct(product_id)),
            Some(_) => {}
        }
        match self.branches.get(&branch_id) {
            None => Err(TargetError::UnknownBranch(branch_id)),
            Some(b) if !b.active => Err(TargetError::InactiveBranch(branch_id)),
            Some(_) => Ok(()),
        }
    }
}
