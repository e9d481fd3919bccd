use std::collections::HashSet;

use once_cell::sync::Lazy;

use crate::aliases::{CANONICAL_TABLES, TABLE_ALIASES};

static GLOBAL: Lazy<TableRegistry> = Lazy::new(TableRegistry::new);

/// Ordered catalog of canonical tables plus the legacy-name resolver.
#[derive(Debug)]
pub struct TableRegistry {
    order: &'static [&'static str],
    members: HashSet<&'static str>,
}

impl TableRegistry {
    fn new() -> Self {
        Self {
            order: CANONICAL_TABLES,
            members: CANONICAL_TABLES.iter().copied().collect(),
        }
    }

    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Canonical tables in registry order.
    #[must_use]
    pub fn tables(&self) -> &'static [&'static str] {
        self.order
    }

    /// Resolve a table name from any exporter generation.
    ///
    /// The name is trimmed and lower-cased, mapped through the alias table,
    /// then checked against the catalog. `None` means the entry is dropped.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&'static str> {
        let lowered = name.trim().to_lowercase();
        let candidate = TABLE_ALIASES.get(lowered.as_str()).copied().unwrap_or(lowered.as_str());
        self.members.get(candidate).copied()
    }
}
