// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Maintenance scopes and the lock compatibility rules between them.
//!
//! A dag that carries a locking scope (global, tenant or proxy) holds a
//! maintenance lock from creation until it reaches a terminal state. Two
//! locks in the same namespace conflict when their scopes overlap.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of maintenance a dag performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaintenanceType {
    NotBootstrap,
    NotUnderMaintenance,
    GlobalMaintenance,
    TenantMaintenance,
    ProxyMaintenance,
}

impl MaintenanceType {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::NotBootstrap => 0,
            Self::NotUnderMaintenance => 1,
            Self::GlobalMaintenance => 2,
            Self::TenantMaintenance => 3,
            Self::ProxyMaintenance => 4,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::NotBootstrap),
            1 => Some(Self::NotUnderMaintenance),
            2 => Some(Self::GlobalMaintenance),
            3 => Some(Self::TenantMaintenance),
            4 => Some(Self::ProxyMaintenance),
            _ => None,
        }
    }
}

/// Maintenance scope of a dag: a type plus a key (tenant name for tenant
/// maintenance, empty otherwise).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Maintainer {
    #[serde(rename = "type")]
    pub kind: MaintenanceType,
    #[serde(default)]
    pub key: String,
}

impl Default for Maintainer {
    fn default() -> Self {
        Self::none()
    }
}

impl Maintainer {
    /// Not under maintenance. Never locks.
    pub fn none() -> Self {
        Self {
            kind: MaintenanceType::NotUnderMaintenance,
            key: String::new(),
        }
    }

    /// Cluster not yet bootstrapped. Never locks.
    pub fn not_bootstrap() -> Self {
        Self {
            kind: MaintenanceType::NotBootstrap,
            key: String::new(),
        }
    }

    pub fn global() -> Self {
        Self {
            kind: MaintenanceType::GlobalMaintenance,
            key: String::new(),
        }
    }

    pub fn tenant(name: impl Into<String>) -> Self {
        Self {
            kind: MaintenanceType::TenantMaintenance,
            key: name.into(),
        }
    }

    pub fn proxy() -> Self {
        Self {
            kind: MaintenanceType::ProxyMaintenance,
            key: String::new(),
        }
    }

    /// Whether a dag with this scope takes a maintenance lock.
    pub fn is_locking(&self) -> bool {
        matches!(
            self.kind,
            MaintenanceType::GlobalMaintenance
                | MaintenanceType::TenantMaintenance
                | MaintenanceType::ProxyMaintenance
        )
    }

    /// Whether two scopes cannot hold locks at the same time.
    pub fn overlaps(&self, other: &Maintainer) -> bool {
        use MaintenanceType::*;
        if !self.is_locking() || !other.is_locking() {
            return false;
        }
        match (self.kind, other.kind) {
            (GlobalMaintenance, _) | (_, GlobalMaintenance) => true,
            (TenantMaintenance, TenantMaintenance) => self.key == other.key,
            (ProxyMaintenance, ProxyMaintenance) => true,
            _ => false,
        }
    }

    /// Combine two scopes into the narrowest scope covering both.
    ///
    /// Non-locking scopes are identities; any two distinct locking scopes
    /// widen to global.
    pub fn merge(&self, other: &Maintainer) -> Maintainer {
        use MaintenanceType::*;
        match (self.is_locking(), other.is_locking()) {
            (false, false) => {
                if self.kind == NotUnderMaintenance || other.kind == NotUnderMaintenance {
                    Maintainer::none()
                } else {
                    Maintainer::not_bootstrap()
                }
            }
            (false, true) => other.clone(),
            (true, false) => self.clone(),
            (true, true) => match (self.kind, other.kind) {
                (TenantMaintenance, TenantMaintenance) if self.key == other.key => self.clone(),
                (ProxyMaintenance, ProxyMaintenance) => Maintainer::proxy(),
                _ => Maintainer::global(),
            },
        }
    }
}

impl fmt::Display for Maintainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}({})", self.kind, self.key)
        }
    }
}
