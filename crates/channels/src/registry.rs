use {super::plugin::ChannelPlugin, std::collections::HashMap};

/// Registry of all loaded channel plugins.
pub struct ChannelRegistry {
    plugins: HashMap<String, Box<dyn ChannelPlugin>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    pub fn register(&mut self, plugin: Box<dyn ChannelPlugin>) {
        self.plugins.insert(plugin.id().to_string(), plugin);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&dyn ChannelPlugin> {
        self.plugins.get(id).map(|p| p.as_ref())
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Box<dyn ChannelPlugin>> {
        self.plugins.get_mut(id)
    }

    #[must_use]
    pub fn list(&self) -> Vec<&str> {
        self.plugins.keys().map(|s| s.as_str()).collect()
    }

    /// Stop the given accounts on every plugin during gateway shutdown.
    /// Failures are logged and do not prevent the remaining stops.
    pub async fn stop_accounts(&mut self, accounts: &[(String, String)]) {
        for (channel, account_id) in accounts {
            if let Some(plugin) = self.plugins.get_mut(channel)
                && let Err(e) = plugin.stop_account(account_id).await
            {
                tracing::warn!(channel, account_id, error = %e, "failed to stop account");
            }
        }
    }
}
