//! Account registries.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::traits::AccountRegistry;
use crate::types::Platform;

/// Authorizes every account. The default when the host has no connection
/// layer to consult.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAccountRegistry;

#[async_trait]
impl AccountRegistry for OpenAccountRegistry {
    async fn is_authorized(&self, _platform: Platform, _account_id: &str) -> bool {
        true
    }
}

/// A fixed allow-list of `(platform, account_id)` pairs that can be edited
/// at runtime as accounts connect and disconnect.
#[derive(Debug, Default)]
pub struct StaticAccountRegistry {
    accounts: RwLock<HashSet<(Platform, String)>>,
}

impl StaticAccountRegistry {
    pub fn new<I, S>(accounts: I) -> Self
    where
        I: IntoIterator<Item = (Platform, S)>,
        S: Into<String>,
    {
        Self {
            accounts: RwLock::new(accounts.into_iter().map(|(p, a)| (p, a.into())).collect()),
        }
    }

    pub fn connect(&self, platform: Platform, account_id: impl Into<String>) {
        self.accounts.write().insert((platform, account_id.into()));
    }

    pub fn disconnect(&self, platform: Platform, account_id: &str) {
        self.accounts
            .write()
            .remove(&(platform, account_id.to_string()));
    }
}

#[async_trait]
impl AccountRegistry for StaticAccountRegistry {
    async fn is_authorized(&self, platform: Platform, account_id: &str) -> bool {
        self.accounts
            .read()
            .contains(&(platform, account_id.to_string()))
    }
}
